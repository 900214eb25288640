//! 应用层实现。
//!
//! 令牌生命周期、准入控制（限流与幂等）和事件扇出的用例服务，
//! 存储与连接注册表通过领域层接口注入。

pub mod clock;
pub mod error;
pub mod fanout;
pub mod idempotency;
pub mod maintenance;
pub mod rate_limiter;
pub mod session;
pub mod tokens;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use fanout::EventFanout;
pub use idempotency::{Admission, IdempotencyGuard, IdempotencyTicket, Outcome};
pub use maintenance::{MaintenanceSweeper, SweepReport};
pub use rate_limiter::RateLimiter;
pub use session::{Session, SessionService};
pub use tokens::TokenService;
