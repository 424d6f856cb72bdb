/// Database model definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Turn record and score persistence behind the shared store contract.
pub mod turn_store;
