//! Connectivity tracking and the offline-aware request client.

pub mod client;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod status;
pub mod transport;

pub use client::{ApiResponse, DrainReport, NetworkClient, RequestConfig, RequestOptions, ResponseBody};
pub use error::RequestError;
pub use monitor::{ListenerId, NetworkMonitor};
pub use queue::QueuedRequestInfo;
pub use status::{ConnectivityProbe, ManualProbe, NetworkStatus};
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};
