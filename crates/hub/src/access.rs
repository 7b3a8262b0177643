//! Ownership checks run by request handlers before any plant data reaches
//! an evaluator.

use crate::model::Plant;

/// Header carrying the caller's owner name.
pub const OWNER_HEADER: &str = "x-owner";

/// Unowned plants are visible to everyone; owned plants only to their owner.
pub fn can_access(plant_owner: Option<&str>, requester: Option<&str>) -> bool {
    match plant_owner {
        None => true,
        Some(owner) => requester == Some(owner),
    }
}

/// Pass the plant through if `requester` may see it. Callers report `None`
/// the same way as a missing plant.
pub fn authorize_plant(plant: Option<Plant>, requester: Option<&str>) -> Option<Plant> {
    plant.filter(|p| can_access(p.owner.as_deref(), requester))
}
