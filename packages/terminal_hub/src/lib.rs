//! Terminal Hub - shared shell sessions for collaborative projects
//!
//! Many browser clients attach to one project and drive its shell sessions
//! together. Every create, resize, input and close is applied once and then
//! broadcast, so all clients converge on the same view. Output that announces
//! a `http://localhost:<port>` dev server is turned into the project's preview
//! URL.
//!
//! The execution runtime and the deployment clients are traits
//! ([`SessionRuntime`], [`ExecutionEnvironment`], [`AppPlatform`], ...);
//! [`LocalRuntime`] hosts sessions as local PTYs.

pub mod config;
pub mod deploy;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod keyed_lock;
pub mod local_runtime;
pub mod output_buffer;
pub mod preview;
pub mod project;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;

#[cfg(test)]
mod test_helpers;

pub use config::HubConfig;
pub use deploy::{AppPlatform, FileMaterializer, ServerContext, VersionControl};
pub use error::{HubError, RuntimeError};
pub use fanout::{ConnectionFanout, ConnectionInfo, ConnectionManager, ConnectionSink};
pub use handlers::ProjectHandlers;
pub use keyed_lock::KeyedLock;
pub use local_runtime::LocalRuntime;
pub use output_buffer::OutputBuffer;
pub use preview::detect_port;
pub use project::{PreviewState, Project};
pub use protocol::{ClientRequest, Reply, RequestEnvelope, ServerEvent};
pub use registry::{OutputCallback, RegistryConfig, SessionRegistry};
pub use runtime::{ExecutionEnvironment, Geometry, OutputSink, SessionHandle, SessionRuntime};
pub use server::{AppState, ProjectFactory, router};
