pub mod time;

pub use time::{now_millis, from_millis};
