//! Services module for the Redfire PBX

pub mod b2bua;
pub mod cdr;
pub mod dialplan;
pub mod dtmf;
pub mod extensions;
pub mod ivr;
pub mod mailbox;
pub mod media_relay;
pub mod registrar;
pub mod webhooks;

pub use b2bua::{B2buaService, Call, CallEvent, CallLeg, CallState};
pub use cdr::{CallDetailRecord, CdrService, CdrSink, Disposition, FileCdrSink};
pub use dialplan::{Dialplan, RouteDecision};
pub use dtmf::{DtmfRouter, DtmfSource};
pub use extensions::{ExtensionRecord, ExtensionStore, InMemoryExtensionStore};
pub use ivr::{IvrEvent, IvrExecutor};
pub use mailbox::{MailboxStore, MessageMeta};
pub use media_relay::{MediaRelay, PortPool, RelayCommand, RelayEvent, RelayStats};
pub use registrar::{Registrar, RegistrarEvent, Registration};
pub use webhooks::{NullWebhookEmitter, WebhookEmitter};
