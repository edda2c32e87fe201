use parking_lot::Mutex;
use std::sync::Arc;

/// State shared between the relay components and their background tasks.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
