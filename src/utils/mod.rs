pub mod error;
pub mod jwt;
pub mod scheduled_executor;

pub use error::{ApiError, ApiResult};
pub use jwt::JwtUtil;
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask, ShutdownHandle};
