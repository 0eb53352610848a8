pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, SocketAddr};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use anyhow::Context as _;
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng;
pub use crate::strng::Strng;
