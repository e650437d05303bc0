pub use bytes::Bytes;
pub use std::pin::Pin;
pub use std::sync::{Arc, Mutex};
pub use std::task::{Context, Poll, ready};
pub use std::time::{Duration, Instant};
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{debug, error, info, trace, warn};
