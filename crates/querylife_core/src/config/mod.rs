pub mod session;
pub mod value;

pub use session::{OverflowMode, SessionConfig, SessionSetting};
pub use value::SettingValue;
