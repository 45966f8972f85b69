pub mod backoff;
pub mod ccw;
pub mod cipher;
pub mod client;
pub mod constants;
pub mod crc;
pub mod dispatch;
pub mod ecm;
pub mod error;
pub mod instance;
pub mod registry;
pub mod service;
pub mod ts;
pub mod types;
pub mod utils;

pub use self::backoff::{Activity, RetryPolicy};
pub use self::ccw::{CcwClient, CcwConfig, CcwInstance};
pub use self::cipher::{
    BatchEntry, CipherFactory, ControlWordCipher, DesNcbCipher, des_ncb_factory,
    des_ncb_factory_sized,
};
pub use self::client::{CasClient, ClientStatus, Descrambler, SectionContext, ServiceStatus};
pub use self::dispatch::{Dispatcher, PacketVerdict};
pub use self::ecm::{EcmOffer, EcmSection, EcmTracker, EcmTrackerSet};
pub use self::error::{CasError, Result};
pub use self::instance::{DescrambleResult, DescramblerInstance};
pub use self::registry::{Registry, ServiceDirectory};
pub use self::service::{AttachedServices, PacketSink, Service, ServiceInfo, ServiceStreams};
pub use self::types::{
    CaidEntry, ClientKind, ControlWord, FeedStatus, KeyState, Parity, ProviderRecord,
};
