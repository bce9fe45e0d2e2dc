mod health;
mod metrics;
mod reading;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use reading::{ReadingPayload, ReadingResponse, reading_handler};
