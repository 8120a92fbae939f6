//! The ingestion gateway, schema manager, and columnar encoder: the three
//! collaborators spec.md names as external to the core but whose
//! interfaces must be honored for the system to run end-to-end.

pub mod encoder;
pub mod gateway;
pub mod schema;
pub mod validator;

pub use encoder::{ColumnarEncoder, EncodeError, EncodedArtifact, JsonLinesEncoder};
pub use gateway::{GatewayError, IngestionGateway};
pub use schema::{PrimitiveType, Repetition, SchemaDocument, SchemaError, SchemaField, SchemaStore};
pub use validator::{validate_record, ValidationError};
