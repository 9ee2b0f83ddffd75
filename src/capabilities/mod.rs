//! Host-provided collaborators: durable storage, the steps REST endpoint,
//! auth credentials and app/network lifecycle.

pub mod credentials;
pub mod http;
pub mod kv;
pub mod lifecycle;

pub use self::credentials::{
    CredentialProvider, Credentials, KvCredentialProvider, Permission, PermissionSnapshot,
    StaticCredentials,
};
pub use self::http::{
    ApiEndpoint, IdempotencyKey, ReqwestStepsApi, StepsApi, TransportError,
};
pub use self::kv::{KeyValueStore, KvError, MemoryKv};
pub use self::lifecycle::{
    AppState, LifecycleEvent, LifecycleHub, LifecycleSnapshot, LifecycleSource,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKv;
