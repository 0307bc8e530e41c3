//! Executes scenario steps against a session.

use thiserror::Error;
use xds_runner::{Session, SessionError};
use xds_types::StepStatus;

use crate::scenario::StepAction;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Assertion(String),
    #[error("step is pending")]
    Pending,
    #[error("step has no definition")]
    Undefined,
}

impl StepError {
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Pending => StepStatus::Pending,
            Self::Undefined => StepStatus::Undefined,
            Self::Session(_) | Self::Assertion(_) => StepStatus::Failed,
        }
    }
}

#[tracing::instrument(name = "xds_suite.steps.run", skip(session, action), fields(session = session.id()))]
pub async fn run_step(session: &mut Session, action: &StepAction) -> Result<(), StepError> {
    match action {
        StepAction::TargetSetup {
            resources, version, ..
        } => {
            session.program_state(resources, version).await?;
        }
        StepAction::StateUpdated { version, .. } => {
            session.update_state(version).await?;
        }
        StepAction::ResourcesAdded {
            resources, version, ..
        } => {
            session.add_resources(resources, version).await?;
        }
        StepAction::WildcardSubscription { service } => {
            session.subscribe(service, &[]).await?;
        }
        StepAction::SubsetSubscription { service, resources } => {
            session.subscribe(service, resources).await?;
        }
        StepAction::SubscriptionUpdated { service, resources } => {
            session.update_subscription(service, resources).await?;
        }
        StepAction::Unsubscribe { service } => {
            session.unsubscribe_all(service).await?;
        }
        StepAction::ExpectResources {
            service,
            resources,
            version,
        } => {
            session
                .wait_for_resources(service, resources, version)
                .await?;
        }
        StepAction::ExpectOnlyResources {
            service,
            resources,
            version,
        } => {
            session
                .wait_for_only_resources(service, resources, version)
                .await?;
        }
        StepAction::ExpectNoResponse { service } => {
            let version = session
                .current_state()
                .map(|state| state.version.clone())
                .ok_or_else(|| SessionError::NoState(session.node_id().to_string()))?;
            session.expect_no_response(service, &version).await?;
        }
        StepAction::AckNotAnswered { service } => {
            session.wait_for_ack(service).await?;
            // give a misbehaving target the chance to answer the ACK
            tokio::time::sleep(session.config().quiet_period).await;
            if !session.terminate_conversation(service).await? {
                return Err(StepError::Assertion(
                    "responses were equal to or more than requests: the target answered the last ACK"
                        .to_string(),
                ));
            }
        }
        StepAction::Pending { .. } => return Err(StepError::Pending),
        StepAction::Undefined => return Err(StepError::Undefined),
    }
    Ok(())
}
