//! Read model views over the committed saga log.

pub mod achievements;
pub mod avatar_inventory;

pub use achievements::{AchievementView, AvatarAchievements, DefeatCredit};
pub use avatar_inventory::AvatarInventoryView;
