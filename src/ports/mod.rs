pub mod kv_store;

pub use kv_store::{KvError, KvEvent, KvResult, KvStore};
