pub mod events;
pub mod ids;
pub mod services;

pub use events::{
    CrashedData, ErroredData, EventBody, EventDecodeError, EventName, NewEvent, Record,
    TriggeredData,
};
pub use ids::CorrelationId;
pub use services::Service;
