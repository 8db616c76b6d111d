use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::ids::CorrelationId;

/// Names of everything the log records. The string form is the wire and
/// storage form.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventName {
    DeploymentTriggered,
    DeploymentSucceeded,
    DeploymentErrored,
    Booted,
    Stopped,
    Crashed,
}

impl EventName {
    pub const ALL: [EventName; 6] = [
        EventName::DeploymentTriggered,
        EventName::DeploymentSucceeded,
        EventName::DeploymentErrored,
        EventName::Booted,
        EventName::Stopped,
        EventName::Crashed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentTriggered => "DeploymentTriggered",
            Self::DeploymentSucceeded => "DeploymentSucceeded",
            Self::DeploymentErrored => "DeploymentErrored",
            Self::Booted => "Booted",
            Self::Stopped => "Stopped",
            Self::Crashed => "Crashed",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = EventDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| EventDecodeError::UnknownName(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("unknown event name: {0}")]
    UnknownName(String),

    #[error("{0} requires a data payload")]
    MissingData(EventName),

    #[error("invalid {name} payload: {source}")]
    Payload {
        name: EventName,
        #[source]
        source: serde_json::Error,
    },
}

/// `DeploymentTriggered` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredData {
    pub service: String,
    pub image: String,
    pub tag: String,
}

/// `DeploymentErrored` payload. `stack` holds whatever diagnostic trail the
/// failure produced (captured stderr for release runs).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErroredData {
    pub message: String,
    pub stack: String,
}

/// `Crashed` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashedData {
    pub message: String,
    pub stack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Event name together with its payload. Variants without data carry none
/// on the wire or on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventBody {
    DeploymentTriggered(TriggeredData),
    DeploymentSucceeded,
    DeploymentErrored(ErroredData),
    Booted,
    Stopped,
    Crashed(CrashedData),
}

impl EventBody {
    pub fn name(&self) -> EventName {
        match self {
            Self::DeploymentTriggered(_) => EventName::DeploymentTriggered,
            Self::DeploymentSucceeded => EventName::DeploymentSucceeded,
            Self::DeploymentErrored(_) => EventName::DeploymentErrored,
            Self::Booted => EventName::Booted,
            Self::Stopped => EventName::Stopped,
            Self::Crashed(_) => EventName::Crashed,
        }
    }

    /// JSON payload, `None` for events that carry no data.
    pub fn data(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        match self {
            Self::DeploymentTriggered(d) => serde_json::to_value(d).map(Some),
            Self::DeploymentErrored(d) => serde_json::to_value(d).map(Some),
            Self::Crashed(d) => serde_json::to_value(d).map(Some),
            Self::DeploymentSucceeded | Self::Booted | Self::Stopped => Ok(None),
        }
    }

    /// Rebuild a body from its stored name and payload. Data attached to a
    /// payload-less event is ignored.
    pub fn from_parts(
        name: EventName,
        data: Option<serde_json::Value>,
    ) -> Result<Self, EventDecodeError> {
        fn payload<T: serde::de::DeserializeOwned>(
            name: EventName,
            data: Option<serde_json::Value>,
        ) -> Result<T, EventDecodeError> {
            let data = data.ok_or(EventDecodeError::MissingData(name))?;
            serde_json::from_value(data).map_err(|source| EventDecodeError::Payload { name, source })
        }

        Ok(match name {
            EventName::DeploymentTriggered => Self::DeploymentTriggered(payload(name, data)?),
            EventName::DeploymentSucceeded => Self::DeploymentSucceeded,
            EventName::DeploymentErrored => Self::DeploymentErrored(payload(name, data)?),
            EventName::Booted => Self::Booted,
            EventName::Stopped => Self::Stopped,
            EventName::Crashed => Self::Crashed(payload(name, data)?),
        })
    }
}

/// An event before the log has assigned it a sequence number and time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    pub id: CorrelationId,
    pub body: EventBody,
}

impl NewEvent {
    pub fn new(id: CorrelationId, body: EventBody) -> Self {
        Self { id, body }
    }

    pub fn name(&self) -> EventName {
        self.body.name()
    }
}

/// An appended, immutable event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub id: CorrelationId,
    pub time: DateTime<Utc>,
    pub body: EventBody,
}

impl Record {
    pub fn name(&self) -> EventName {
        self.body.name()
    }
}

/// Wire shape: `{_seq, id, time, name, data?}` with `time` in RFC 3339.
impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.body.data().map_err(serde::ser::Error::custom)?;
        let mut map = serializer.serialize_map(Some(if data.is_some() { 5 } else { 4 }))?;
        map.serialize_entry("_seq", &self.seq)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry(
            "time",
            &self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry("name", self.name().as_str())?;
        if let Some(data) = data {
            map.serialize_entry("data", &data)?;
        }
        map.end()
    }
}
