//! PTY Manager - local shell sessions for the terminal hub
//!
//! Each session is a PTY actor: one tokio task owning the master side and the
//! child process, plus a blocking reader thread that streams decoded UTF-8 output
//! into an unbounded channel in the order the process produced it.
//!
//! # Example
//!
//! ```no_run
//! use pty_manager::{PtyActor, PtyConfig};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let handle = PtyActor::spawn(PtyConfig::default(), tx).unwrap();
//!
//!     handle.write_str("echo hello\r").await.unwrap();
//!     while let Some(chunk) = rx.recv().await {
//!         print!("{}", chunk);
//!         if chunk.contains("hello") {
//!             break;
//!         }
//!     }
//!     handle.terminate().await.unwrap();
//! }
//! ```

mod error;
mod pty;
mod utf8;

pub use error::PtyError;
pub use pty::{OutputSink, PtyActor, PtyConfig, PtyHandle, PtyState};
pub use utf8::Utf8StreamDecoder;
