use oasis_xmpp::DecodeError;
use oasis_xmpp::stanza::{self, Element, ns};
use tracing::warn;
use xmpp_parsers::http_upload::{self, SlotResult};
use xmpp_parsers::minidom::Node;

/// Headers a slot may ask the uploader to set (XEP-0363 section 5).
const ALLOWED_HEADERS: [&str; 3] = ["Authorization", "Cookie", "Expires"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub filename: String,
    pub size: u64,
    pub content_type: Option<String>,
}

impl SlotRequest {
    pub fn to_element(&self) -> Element {
        http_upload::SlotRequest {
            filename: self.filename.clone(),
            size: self.size,
            content_type: self.content_type.clone(),
        }
        .into()
    }
}

/// Where to PUT the file and where it can be fetched afterwards.
///
/// Valid for one attempt only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub put_url: String,
    pub headers: Vec<(String, String)>,
    pub get_url: String,
}

impl UploadSlot {
    /// Decode the `<slot/>` carried by an IQ result.
    pub fn from_payload(payload: Option<Element>) -> Result<Self, DecodeError> {
        let slot = payload.ok_or(DecodeError::MissingChild {
            element: "iq",
            child: "slot",
        })?;
        Self::from_element(slot)
    }

    pub fn from_element(mut slot: Element) -> Result<Self, DecodeError> {
        stanza::expect_element(&slot, "slot", ns::HTTP_UPLOAD)?;

        // A header outside the allowed set fails the typed decode of the
        // whole slot, so it is dropped here instead.
        if let Some(put) = slot.get_child_mut("put", ns::HTTP_UPLOAD) {
            drop_foreign_headers(put);
        }
        let SlotResult { put, get } =
            SlotResult::try_from(slot).map_err(|e| DecodeError::malformed("slot", e))?;

        Ok(Self {
            put_url: non_empty_url(put.url)?,
            headers: put
                .headers
                .into_iter()
                .map(|header| (header.name.as_str().to_string(), clean_value(&header.value)))
                .collect(),
            get_url: non_empty_url(get.url)?,
        })
    }
}

fn drop_foreign_headers(put: &mut Element) {
    for node in put.take_nodes() {
        let foreign = match &node {
            Node::Element(child) if child.is("header", ns::HTTP_UPLOAD) => {
                let name = child.attr("name").unwrap_or_default();
                let allowed = ALLOWED_HEADERS
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(name));
                if !allowed {
                    warn!(header = %name, "dropping header not allowed on upload slots");
                }
                !allowed
            }
            _ => false,
        };
        if !foreign {
            put.append_node(node);
        }
    }
}

fn non_empty_url(url: String) -> Result<String, DecodeError> {
    if url.trim().is_empty() {
        return Err(DecodeError::InvalidValue {
            field: "slot url",
            value: url,
        });
    }
    Ok(url)
}

/// Header values must not smuggle in line breaks.
fn clean_value(value: &str) -> String {
    value.replace(['\r', '\n'], "").trim().to_string()
}
