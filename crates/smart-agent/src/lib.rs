//! Smart Agent
//!
//! Relays messages from an MQTT broker to long-lived Server-Sent Events
//! clients, and mirrors locally generated events back to the broker.
//!
//! The [`hub`] owns the set of connected streams; [`api`] turns each HTTP
//! request into a hub subscriber; [`source`] routes traffic between the
//! [`broker`] link and the hub.

pub mod api;
pub mod broker;
pub mod config;
pub mod hub;
pub mod source;
