//! XML codecs for the two wire documents this crate speaks: the event
//! envelope (§6, `POST /publish` body) and the subscription-set document
//! (§6, `/subscribers*` bodies).
//!
//! Both codecs walk the document with [`quick_xml::Reader`]/[`quick_xml::Writer`]
//! directly rather than through `serde`: the event envelope carries an
//! arbitrary payload body that must survive round-tripping byte for byte,
//! which a derived `Deserialize` cannot express.

pub mod event;
pub mod subscription_set;

pub use event::{render_event, EventDocError};
pub use subscription_set::{render_subscription_set, SubscriptionDocError};

use crate::error::Error;

impl From<EventDocError> for Error {
    fn from(e: EventDocError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

impl From<SubscriptionDocError> for Error {
    fn from(e: SubscriptionDocError) -> Self {
        Error::BadRequest(e.to_string())
    }
}
