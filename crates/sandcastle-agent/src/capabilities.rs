//! Desktop interaction capabilities
//!
//! A sandbox connection may or may not be able to drive the desktop. Callers
//! ask through [`DesktopCapabilities`] and get back a typed handle, instead of
//! probing a connection for methods at runtime.

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Can click at screen coordinates
#[async_trait::async_trait]
pub trait Clicker: Send + Sync {
    async fn click(&self, x: i32, y: i32, button: MouseButton) -> Result<()>;
}

/// Can type text and press keys
#[async_trait::async_trait]
pub trait Typer: Send + Sync {
    async fn type_text(&self, text: &str) -> Result<()>;

    /// Press a named key or chord such as `Return` or `ctrl+c`
    async fn key_press(&self, key: &str) -> Result<()>;
}

/// Can scroll at screen coordinates
#[async_trait::async_trait]
pub trait Scroller: Send + Sync {
    async fn scroll(&self, x: i32, y: i32, direction: ScrollDirection, amount: u32) -> Result<()>;
}

/// Which desktop capabilities a connection offers
///
/// Every query defaults to `None`; implementations override the ones they
/// support.
pub trait DesktopCapabilities {
    fn clicker(&self) -> Option<&dyn Clicker> {
        None
    }

    fn typer(&self) -> Option<&dyn Typer> {
        None
    }

    fn scroller(&self) -> Option<&dyn Scroller> {
        None
    }

    fn capability_set(&self) -> CapabilitySet {
        CapabilitySet {
            click: self.clicker().is_some(),
            type_text: self.typer().is_some(),
            scroll: self.scroller().is_some(),
        }
    }
}

/// Summary of supported capabilities, for logs and status output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub click: bool,
    pub type_text: bool,
    pub scroll: bool,
}

/// A raw TCP control channel carries no desktop methods of its own
impl DesktopCapabilities for crate::transport::TcpTransport {}
