//! Finding the upload component through service discovery (XEP-0030).

use std::collections::HashSet;
use std::time::Duration;

use futures::future;
use oasis_xmpp::stanza::{Element, IqType, Jid, ns};
use oasis_xmpp::{DecodeError, StanzaLink, StanzaTransport, XmppError};
use tracing::{debug, info, warn};
use xmpp_parsers::disco::{DiscoInfoQuery, DiscoInfoResult, DiscoItemsQuery, DiscoItemsResult};

/// Item levels walked below the roots.
pub const MAX_DEPTH: usize = 3;

/// Upload component and the size limit it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadService {
    pub jid: Jid,
    /// `None` when the service does not advertise a limit
    pub max_file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    /// `max-file-size` from the HTTP upload extension form
    pub max_file_size: Option<u64>,
}

impl DiscoInfo {
    pub fn has_identity(&self, category: &str, kind: &str) -> bool {
        self.identities
            .iter()
            .any(|identity| identity.category == category && identity.kind == kind)
    }

    pub fn is_upload_service(&self) -> bool {
        self.has_identity("store", "file")
    }

    pub fn is_conference(&self) -> bool {
        self.has_identity("conference", "text")
    }
}

impl From<DiscoInfoResult> for DiscoInfo {
    fn from(result: DiscoInfoResult) -> Self {
        let max_file_size = result
            .extensions
            .iter()
            .find(|form| form.form_type() == Some(ns::HTTP_UPLOAD))
            .and_then(|form| {
                form.fields
                    .iter()
                    .find(|field| field.var.as_deref() == Some("max-file-size"))
            })
            .and_then(|field| field.values.first())
            .and_then(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .inspect_err(|e| warn!(value = %raw, error = %e, "unparseable max-file-size"))
                    .ok()
            });

        Self {
            identities: result
                .identities
                .into_iter()
                .map(|identity| Identity {
                    category: identity.category,
                    kind: identity.type_,
                    name: identity.name,
                })
                .collect(),
            features: result.features.into_iter().map(|feature| feature.var).collect(),
            max_file_size,
        }
    }
}

pub fn items_query() -> Element {
    DiscoItemsQuery {
        node: None,
        rsm: None,
    }
    .into()
}

pub fn info_query() -> Element {
    DiscoInfoQuery { node: None }.into()
}

/// Entities listed in a disco#items result.
///
/// Items naming a node address pubsub nodes, not components, and are left out.
pub fn decode_items(payload: Option<Element>) -> Result<Vec<Jid>, DecodeError> {
    let payload = payload.ok_or(DecodeError::MissingChild {
        element: "iq",
        child: "query",
    })?;
    let result =
        DiscoItemsResult::try_from(payload).map_err(|e| DecodeError::malformed("query", e))?;

    Ok(result
        .items
        .into_iter()
        .filter(|item| item.node.is_none())
        .map(|item| item.jid)
        .collect())
}

pub fn decode_info(payload: Option<Element>) -> Result<DiscoInfo, DecodeError> {
    let payload = payload.ok_or(DecodeError::MissingChild {
        element: "iq",
        child: "query",
    })?;
    let result =
        DiscoInfoResult::try_from(payload).map_err(|e| DecodeError::malformed("query", e))?;
    Ok(result.into())
}

/// Failures that end the walk instead of skipping one entity.
fn is_fatal(error: &XmppError) -> bool {
    matches!(error, XmppError::Send(_) | XmppError::ConnectionClosed)
}

async fn info_of<T: StanzaTransport>(
    link: &StanzaLink<T>,
    jid: &Jid,
    timeout: Duration,
) -> Result<Option<DiscoInfo>, XmppError> {
    let answer = link
        .query(Some(jid), IqType::Get, info_query(), timeout)
        .await
        .and_then(|payload| decode_info(payload).map_err(XmppError::from));

    match answer {
        Ok(info) => Ok(Some(info)),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!(jid = %jid, error = %e, "disco#info failed");
            Ok(None)
        }
    }
}

async fn items_of<T: StanzaTransport>(
    link: &StanzaLink<T>,
    jid: &Jid,
    timeout: Duration,
) -> Result<Vec<Jid>, XmppError> {
    let answer = link
        .query(Some(jid), IqType::Get, items_query(), timeout)
        .await
        .and_then(|payload| decode_items(payload).map_err(XmppError::from));

    match answer {
        Ok(items) => Ok(items),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => {
            debug!(jid = %jid, error = %e, "disco#items failed");
            Ok(Vec::new())
        }
    }
}

/// Walk the entity tree under `roots` and return the first HTTP upload
/// component.
///
/// Roots are queried themselves first, so a server hosting the upload service
/// on its own domain is found. Each level is queried concurrently and checked
/// in listing order. Conference components are never descended into, entities
/// already seen are skipped, and the walk stops [`MAX_DEPTH`] levels below
/// the roots. An entity that fails to answer is logged and skipped; only a
/// broken stream aborts the walk.
pub async fn discover<T: StanzaTransport>(
    link: &StanzaLink<T>,
    roots: &[Jid],
    timeout: Duration,
) -> Result<Option<UploadService>, XmppError> {
    let mut visited: HashSet<Jid> = HashSet::new();
    let mut level: Vec<Jid> = roots
        .iter()
        .filter(|jid| visited.insert((*jid).clone()))
        .cloned()
        .collect();
    let mut depth = 0;

    while !level.is_empty() {
        let infos = future::join_all(level.iter().map(|jid| info_of(link, jid, timeout))).await;

        let mut walk = Vec::new();
        for (jid, info) in level.into_iter().zip(infos) {
            let Some(info) = info? else {
                continue;
            };
            if info.is_upload_service() {
                info!(jid = %jid, max_file_size = ?info.max_file_size, "found upload service");
                return Ok(Some(UploadService {
                    jid,
                    max_file_size: info.max_file_size,
                }));
            }
            if info.is_conference() {
                debug!(jid = %jid, "not walking conference component");
                continue;
            }
            walk.push(jid);
        }

        if depth == MAX_DEPTH {
            debug!(depth, "discovery depth limit reached");
            break;
        }

        let listings = future::join_all(walk.iter().map(|jid| items_of(link, jid, timeout))).await;
        let mut next = Vec::new();
        for items in listings {
            next.extend(items?.into_iter().filter(|item| visited.insert(item.clone())));
        }
        debug!(depth, count = next.len(), "discovered items");

        level = next;
        depth += 1;
    }

    Ok(None)
}
