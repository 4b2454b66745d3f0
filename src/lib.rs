//! Mock Stub Server
//!
//! A standalone HTTP stub server for tests: register stub mappings, send
//! requests through the bundled client, assert on the responses and verify
//! what the server received.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, URL (exact, prefix, regex, glob,
//!   template), headers, query params and body
//! - **Scripted Responses**: Static or Handlebars-templated bodies
//! - **Request Journal**: Every request is recorded, matched or not
//! - **Verification**: Exact, at-least and at-most count checks
//! - **Diagnostics**: `Matched-Stub-Name` headers and near-miss reports
//!
//! # Example Configuration
//!
//! ```yaml
//! server:
//!   port: 8080
//! stubs:
//!   - name: mock_demo_2
//!     request:
//!       method: [GET]
//!       url:
//!         type: exact
//!         value: /mock/demo/2
//!     response:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           name: John
//! ```

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod journal;
mod json_path;
pub mod matcher;
pub mod registry;
pub mod server;
pub mod template;

pub use client::{AssertionFailure, ClientConfig, ClientResponse, ContentType, StubClient};
pub use config::{ServerOptions, StubDefinition, StubServerConfig};
pub use error::StubError;
pub use journal::{CountMatcher, LoggedRequest};
pub use registry::{MappingId, StubMapping};
pub use server::{StubResponse, StubServer, StubState, MATCHED_STUB_ID, MATCHED_STUB_NAME};
