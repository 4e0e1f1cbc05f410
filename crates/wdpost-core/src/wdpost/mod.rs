//! Window PoSt - deadline ごとの証明計算と提出
//!
//! - `WdPostScheduler`: epoch callback。challenge が開いた deadline の compute task を作る
//! - `WdPost` / `WdPostComputeHandler`: fault を除外して証明を計算
//! - `WdPostSubmit` / `WdPostSubmitHandler`: payer を選んで outbox に渡し、確定を待つ
//! - `WdPostRecover` / `WdPostRecoverHandler`: 次の deadline の fault / recovery を challenge 前に宣言
//! - `FaultTracker`, `AddressSelector`: 上の handler が使う部品

pub mod address_selector;
pub mod compute;
pub mod fault_tracker;
pub mod recover;
pub mod submit;


pub use self::address_selector::AddressSelector;
pub use self::compute::{ComputeConfig, WdPost, WdPostComputeHandler, WdPostScheduler};
pub use self::fault_tracker::{FaultTracker, FaultTrackerConfig};
pub use self::recover::{Declaration, WdPostRecover, WdPostRecoverHandler};
pub use self::submit::{SubmitConfig, WdPostSubmit, WdPostSubmitHandler};
