pub mod memory;

use std::sync::Arc;
use tether_core::DriverRegistry;

pub use memory::MemoryFactory;

/// Drivers compiled into the server binary.
pub fn builtin_registry() -> DriverRegistry {
    DriverRegistry::new().with("memory", Arc::new(MemoryFactory::new()))
}
