//! Backend key layout.
//!
//! | Key | Holds |
//! |---|---|
//! | `canvas:{id}:image` | header + row-major palette indices |
//! | `canvas:{id}:palette` | packed 24-bit RGB entries |
//! | `canvas:{id}:log` | two u32 owner halves per pixel |
//! | `canvas:{id}:pubsub` | pub/sub channel of pixel records |
//! | `canvas:{id}:user:{token}` | cooldown marker |

use crate::types::CanvasId;

/// Keys belonging to one canvas.
#[derive(Debug, Clone)]
pub struct CanvasKeys {
    prefix: String,
}

impl CanvasKeys {
    #[must_use]
    pub fn new(canvas: CanvasId) -> Self {
        Self {
            prefix: format!("canvas:{}", canvas),
        }
    }

    #[must_use]
    pub fn image(&self) -> String {
        format!("{}:image", self.prefix)
    }

    #[must_use]
    pub fn palette(&self) -> String {
        format!("{}:palette", self.prefix)
    }

    #[must_use]
    pub fn log(&self) -> String {
        format!("{}:log", self.prefix)
    }

    #[must_use]
    pub fn pubsub(&self) -> String {
        format!("{}:pubsub", self.prefix)
    }

    /// Cooldown marker for a credential.
    #[must_use]
    pub fn user(&self, token: &str) -> String {
        format!("{}:user:{}", self.prefix, token)
    }
}
