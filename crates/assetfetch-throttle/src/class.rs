use serde::{Deserialize, Serialize};

/// Request class a queued request is filed under.
///
/// `Texture` and `Inventory` are approved classes: the caller asked for
/// permission before issuing them, so they are served first. `Mesh` and
/// `Other` are best-effort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    Texture,
    Inventory,
    Mesh,
    Other,
}

impl RequestClass {
    pub const COUNT: usize = 4;
    pub const APPROVED: usize = 2;
    pub const ALL: [RequestClass; Self::COUNT] = [
        RequestClass::Texture,
        RequestClass::Inventory,
        RequestClass::Mesh,
        RequestClass::Other,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestClass::Texture => "texture",
            RequestClass::Inventory => "inventory",
            RequestClass::Mesh => "mesh",
            RequestClass::Other => "other",
        }
    }
}

/// Tie-break policy used when picking which class to serve next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairnessPolicy {
    /// Alternate between the approved classes when their queues are equally deep.
    pub alternate_on_tie: bool,
    /// Rotate the best-effort classes on every dequeue regardless of depth.
    pub rotate_best_effort: bool,
}

impl Default for FairnessPolicy {
    fn default() -> Self {
        Self {
            alternate_on_tie: true,
            rotate_best_effort: true,
        }
    }
}
