//! Read models derived from the committed saga transaction log.
//!
//! This crate provides the downstream side of the log:
//! - [`Projection`] trait for folding committed transactions into read models
//! - [`ReadModel`] trait for query access to denormalized data
//! - [`ProjectionProcessor`] for feeding the committed log to projections
//! - Two views: avatar inventory and achievements
//!
//! Projections never write to the log. Every view can be thrown away and
//! rebuilt from the committed transactions at any time.

pub mod error;
pub mod processor;
pub mod projection;
pub mod read_model;
pub mod views;

pub use error::{ProjectionError, Result};
pub use processor::ProjectionProcessor;
pub use projection::{Projection, ProjectionPosition};
pub use read_model::ReadModel;
pub use views::{AchievementView, AvatarAchievements, AvatarInventoryView, DefeatCredit};
