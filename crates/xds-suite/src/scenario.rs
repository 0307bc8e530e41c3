//! Scenario model: named, tagged sequences of protocol steps.

use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

/// What a step does against the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    TargetSetup {
        service: String,
        resources: Vec<String>,
        version: String,
    },
    StateUpdated {
        service: String,
        version: String,
    },
    ResourcesAdded {
        service: String,
        resources: Vec<String>,
        version: String,
    },
    WildcardSubscription {
        service: String,
    },
    SubsetSubscription {
        service: String,
        resources: Vec<String>,
    },
    SubscriptionUpdated {
        service: String,
        resources: Vec<String>,
    },
    Unsubscribe {
        service: String,
    },
    ExpectResources {
        service: String,
        resources: Vec<String>,
        version: String,
    },
    ExpectOnlyResources {
        service: String,
        resources: Vec<String>,
        version: String,
    },
    /// Nothing arrives for the version of the latest programmed state.
    ExpectNoResponse {
        service: String,
    },
    /// The final ACK of the conversation stays unanswered.
    AckNotAnswered {
        service: String,
    },
    Pending {
        description: String,
    },
    #[serde(other)]
    Undefined,
}

impl StepAction {
    /// Step text in the harness vocabulary.
    pub fn describe(&self) -> String {
        match self {
            Self::TargetSetup {
                service,
                resources,
                version,
            } => format!(
                "a target setup with service \"{service}\", resources \"{}\", and starting version \"{version}\"",
                resources.join(",")
            ),
            Self::StateUpdated { service, version } => {
                format!("the resources of the \"{service}\" are updated to version \"{version}\"")
            }
            Self::ResourcesAdded {
                service,
                resources,
                version,
            } => format!(
                "the resources \"{}\" are added to the \"{service}\" with version \"{version}\"",
                resources.join(",")
            ),
            Self::WildcardSubscription { service } => {
                format!("the Client does a wildcard subscription to \"{service}\"")
            }
            Self::SubsetSubscription { service, resources } => format!(
                "the Client subscribes to a subset of resources,\"{}\", for \"{service}\"",
                resources.join(",")
            ),
            Self::SubscriptionUpdated { service, resources } => format!(
                "the Client updates subscription to the resources \"{}\" of \"{service}\"",
                resources.join(",")
            ),
            Self::Unsubscribe { service } => {
                format!("the Client unsubscribes from all resources for \"{service}\"")
            }
            Self::ExpectResources {
                service,
                resources,
                version,
            } => format!(
                "the Client receives the resources \"{}\" and version \"{version}\" for \"{service}\"",
                resources.join(",")
            ),
            Self::ExpectOnlyResources {
                service,
                resources,
                version,
            } => format!(
                "the Client receives only the resources \"{}\" and version \"{version}\" for \"{service}\"",
                resources.join(",")
            ),
            Self::ExpectNoResponse { service } => {
                format!("the Client does not receive any message from \"{service}\"")
            }
            Self::AckNotAnswered { service } => {
                format!("the Client sends an ACK to which the \"{service}\" does not respond")
            }
            Self::Pending { description } => description.clone(),
            Self::Undefined => "an undefined step".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keyword {
    Given,
    When,
    Then,
    And,
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Given => "Given",
            Self::When => "When",
            Self::Then => "Then",
            Self::And => "And",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub keyword: Keyword,
    pub text: String,
    /// `file:line` where the step was declared.
    #[serde(default)]
    pub location: String,
    pub action: StepAction,
}

impl Step {
    #[track_caller]
    pub fn new(keyword: Keyword, action: StepAction) -> Self {
        let caller = Location::caller();
        Self {
            keyword,
            text: action.describe(),
            location: format!("{}:{}", caller.file(), caller.line()),
            action,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.keyword, self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    #[track_caller]
    pub fn given(self, action: StepAction) -> Self {
        self.step(Keyword::Given, action)
    }

    #[track_caller]
    pub fn when(self, action: StepAction) -> Self {
        self.step(Keyword::When, action)
    }

    #[track_caller]
    pub fn then(self, action: StepAction) -> Self {
        self.step(Keyword::Then, action)
    }

    #[track_caller]
    pub fn and(self, action: StepAction) -> Self {
        self.step(Keyword::And, action)
    }

    #[track_caller]
    fn step(mut self, keyword: Keyword, action: StepAction) -> Self {
        self.steps.push(Step::new(keyword, action));
        self
    }
}
