//! CDP-based browser attachment.
//!
//! - Daemon model: the browser persists between tool calls via SessionManager
//! - CDP protocol: Chrome DevTools Protocol over WebSocket
//! - Session isolation: multiple independent browser sessions, one capture at a time each

pub mod cdp;
pub mod session;

pub use cdp::CdpClient;
pub use session::{BrowserSession, SessionManager};
