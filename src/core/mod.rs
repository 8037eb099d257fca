pub mod clock;
pub mod error;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TrialError};
pub use record::{SubscriptionTier, TrialRecordPatch, UserId, UserTrialRecord};
