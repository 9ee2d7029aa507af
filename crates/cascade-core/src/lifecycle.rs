use crate::CoreError;
use cascade_schema::EnvState;

/// Validate a lifecycle transition for one environment.
///
/// `Error` is reachable from any non-terminal state; recovery from `Error`
/// goes to `Running` or `Stopped` once an operator has intervened.
pub fn validate_transition(from: EnvState, to: EnvState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (EnvState::Provisioning, EnvState::Running)
            | (EnvState::Running, EnvState::Stopped)
            | (EnvState::Stopped, EnvState::Running)
            | (EnvState::Running | EnvState::Stopped, EnvState::Destroying)
            | (EnvState::Destroying, EnvState::Destroyed)
            | (
                EnvState::Provisioning
                    | EnvState::Running
                    | EnvState::Stopped
                    | EnvState::Destroying,
                EnvState::Error
            )
            | (EnvState::Error, EnvState::Running | EnvState::Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
