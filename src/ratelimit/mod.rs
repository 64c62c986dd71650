//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod descriptor;
mod distributed;
mod identity;
mod limiter;
mod rules;

pub use backend::{CounterBackend, RateLimitResult, WindowHit};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterEntry, LocalStore};
pub use descriptor::{KeyNamespace, PolicyKey};
pub use distributed::{BackendSlot, RedisBackend};
pub use identity::{redact_email, resolve_client_key, RequestHeaders};
pub use limiter::{GuardContext, RateLimitEngine, RequestContext};
pub use rules::{FailureMode, KeyScope, Policy, PolicyKind, PolicySet, Threshold};
