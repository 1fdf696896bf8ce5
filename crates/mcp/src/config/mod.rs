//! Descriptor loading, validation and gateway settings.
//!
//! Backend descriptors live in a JSON or YAML file that the gateway only ever
//! reads. Environment bindings may reference the gateway's own environment
//! through `${env:NAME}` placeholders, resolved when a session is acquired.

mod interpolation;
mod io;
mod model;
mod store;
mod validation;

pub use interpolation::{InterpolationError, interpolate_string, interpolate_with, resolve_env_bindings, resolve_headers};
pub use io::{DESCRIPTORS_PATH_ENV, FileFormat, default_descriptor_path, load_descriptors_from_path, parse_descriptor_file};
pub use model::{ConfigError, DescriptorFile, GatewaySettings, LifecycleSettings, RuntimeBackend, SandboxSettings};
pub use store::{DescriptorStore, FileDescriptorStore, StaticDescriptorStore};
pub use validation::{ValidationError, validate_backend_id, validate_descriptor, validate_descriptors};
