//! Page embeds kept in step with page lifecycle events.
//!
//! A parent page lists its sub-pages as `pageEmbedComponent` elements in the
//! `default` XML fragment of its document, keyed by the `entity_identifier`
//! attribute. When the REST API reports that a page was created under,
//! moved between, duplicated within or deleted from a parent, the server
//! edits the parent's document through [`SessionRegistry::transact`] so every
//! connected editor sees the change as an ordinary update.

use quire_common::types::DocumentKey;
use tracing::{debug, warn};
use uuid::Uuid;
use yrs::{
    TransactionMut, WriteTxn, Xml, XmlElementPrelim, XmlElementRef, XmlFragment, XmlFragmentRef,
    XmlOut,
};

use crate::session::SessionRegistry;

pub const EMBED_FRAGMENT: &str = "default";
pub const EMBED_TAG: &str = "pageEmbedComponent";
pub const ENTITY_ATTR: &str = "entity_identifier";
const ENTITY_NAME_ATTR: &str = "entity_name";
const EMBED_ID_ATTR: &str = "id";
const WORKSPACE_ATTR: &str = "workspace_identifier";
const SUB_PAGE: &str = "sub_page";

/// One edit to a parent page's embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedChange {
    /// Append an embed of `page` to the end of `parent`.
    Append { parent: Uuid, page: Uuid },
    /// Drop every embed of `page` from `parent`.
    Remove { parent: Uuid, page: Uuid },
    /// Place an embed of `copy` right after each embed of `source`.
    Duplicate { parent: Uuid, source: Uuid, copy: Uuid },
}

impl EmbedChange {
    pub fn parent(&self) -> Uuid {
        match *self {
            Self::Append { parent, .. }
            | Self::Remove { parent, .. }
            | Self::Duplicate { parent, .. } => parent,
        }
    }

    /// Apply the change to a document. Returns the number of embeds added
    /// or removed.
    pub fn apply(&self, txn: &mut TransactionMut, workspace_id: Uuid) -> usize {
        match *self {
            Self::Append { page, .. } => {
                let root = txn.get_or_insert_xml_fragment(EMBED_FRAGMENT);
                let embed = root.push_back(txn, XmlElementPrelim::empty(EMBED_TAG));
                describe_embed(txn, &embed, page, workspace_id);
                1
            }
            Self::Remove { page, .. } => edit_embeds_of(txn, page, |txn, parent, index| {
                parent.remove(txn, index);
            }),
            Self::Duplicate { source, copy, .. } => {
                edit_embeds_of(txn, source, |txn, parent, index| {
                    let embed = parent.insert(txn, index + 1, XmlElementPrelim::empty(EMBED_TAG));
                    describe_embed(txn, &embed, copy, workspace_id);
                })
            }
        }
    }
}

/// What a lifecycle event means for parent embeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMove {
    pub page: Option<Uuid>,
    pub parent: Option<Uuid>,
    pub old_parent: Option<Uuid>,
    pub new_parent: Option<Uuid>,
    pub new_page: Option<Uuid>,
}

/// Embed edits implied by `action`. Unknown actions and events missing the
/// ids an action needs imply none.
pub fn plan_embed_changes(action: &str, refs: PageMove) -> Vec<EmbedChange> {
    let Some(page) = refs.page else {
        return Vec::new();
    };

    match action {
        "sub_page" => refs.parent.map(|parent| EmbedChange::Append { parent, page }).into_iter().collect(),
        "deleted" => refs.parent.map(|parent| EmbedChange::Remove { parent, page }).into_iter().collect(),
        "duplicated" => match (refs.parent, refs.new_page) {
            (Some(parent), Some(copy)) => vec![EmbedChange::Duplicate { parent, source: page, copy }],
            _ => Vec::new(),
        },
        "moved_internally" => {
            let mut changes = Vec::new();
            if let Some(parent) = refs.old_parent {
                changes.push(EmbedChange::Remove { parent, page });
            }
            if let Some(parent) = refs.new_parent {
                changes.push(EmbedChange::Append { parent, page });
            }
            changes
        }
        _ => Vec::new(),
    }
}

/// Run `changes` against the parents' documents, one server transaction per
/// change. Failures are logged and do not stop later changes.
pub async fn apply_embed_changes(
    registry: &SessionRegistry,
    workspace_id: Uuid,
    changes: Vec<EmbedChange>,
) -> usize {
    let mut applied = 0;
    for change in changes {
        let key = DocumentKey::new(workspace_id, change.parent());
        match registry.transact(key, move |txn| change.apply(txn, workspace_id)).await {
            Ok(edited) => {
                applied += 1;
                debug!(
                    workspace_id = %workspace_id,
                    document_id = %key.document_id,
                    change = ?change,
                    edited,
                    "page embeds updated"
                );
            }
            Err(error) => {
                warn!(
                    workspace_id = %workspace_id,
                    document_id = %key.document_id,
                    change = ?change,
                    error = %error,
                    "failed to update page embeds"
                );
            }
        }
    }
    applied
}

fn describe_embed(txn: &mut TransactionMut, embed: &XmlElementRef, page: Uuid, workspace_id: Uuid) {
    embed.insert_attribute(txn, ENTITY_ATTR, page.to_string());
    embed.insert_attribute(txn, ENTITY_NAME_ATTR, SUB_PAGE);
    embed.insert_attribute(txn, EMBED_ID_ATTR, Uuid::new_v4().to_string());
    embed.insert_attribute(txn, WORKSPACE_ATTR, workspace_id.to_string());
}

fn is_embed_of(txn: &TransactionMut, element: &XmlElementRef, page: &str) -> bool {
    element.try_tag().is_some_and(|tag| &**tag == EMBED_TAG)
        && element.get_attribute(txn, ENTITY_ATTR).as_deref() == Some(page)
}

/// Visit every embed of `page` at any depth. Each parent's matches are
/// edited right to left so earlier indices stay valid.
fn edit_embeds_of(
    txn: &mut TransactionMut,
    page: Uuid,
    mut edit: impl FnMut(&mut TransactionMut, &XmlFragmentRef, u32),
) -> usize {
    let page = page.to_string();
    let mut pending = vec![txn.get_or_insert_xml_fragment(EMBED_FRAGMENT)];
    let mut edited = 0;

    while let Some(parent) = pending.pop() {
        let mut matches = Vec::new();
        for index in 0..parent.len(&*txn) {
            match parent.get(&*txn, index) {
                Some(XmlOut::Element(element)) => {
                    if is_embed_of(txn, &element, &page) {
                        matches.push(index);
                    } else {
                        let nested: &XmlFragmentRef = element.as_ref();
                        pending.push(nested.clone());
                    }
                }
                Some(XmlOut::Fragment(fragment)) => pending.push(fragment),
                Some(XmlOut::Text(_)) | None => {}
            }
        }

        for index in matches.into_iter().rev() {
            edit(txn, &parent, index);
            edited += 1;
        }
    }
    edited
}
