//! Serial-based metering: persisted activation state machine, offline
//! queue, authority client, metering strategies, and the background
//! activation manager.

pub mod activation;
pub mod client;
pub mod metering;
pub mod offline_queue;
pub mod store;

pub use activation::ActivationManager;
pub use client::{
    ActivateOutcome, MeterDenial, MeterOutcome, MeterReceipt, RefreshOutcome, SerialClient,
    StatusOutcome,
};
pub use metering::{
    classify_copilot_category, make_request_id, LedgerMeteringStrategy, MeterCategory,
    MeterDecision, MeteringError, MeteringStrategy, SerialMeteringStrategy,
};
pub use offline_queue::{OfflineQueue, PendingMeterEvent};
pub use store::{
    DiskPersistence, MemoryPersistence, SerialPhase, SerialState, SerialStore, StatePersistence,
    StoreError,
};
