//! Delivery workers.

mod delivery;

pub use delivery::{
    DeliveryConfig, DeliveryWorker, TickSummary, TimerDelivery, spawn_delivery_worker,
};
