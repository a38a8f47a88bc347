pub mod database;
pub mod idgen;
pub mod logging;

pub use database::{Database, InMemoryDatabase};
pub use idgen::{IdGenerator, NumericalIdGenerator, RandomIdGenerator};
pub use logging::init_logging;
