use serde::{Deserialize, Serialize};

use capros_types::{BaseType, ObCount, Oid};

use crate::node::NodeData;
use crate::page::PageBuf;

/// Contents of a migrated object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomeBody {
    Page(Vec<u8>),
    Node(NodeData),
}

/// An object at its permanent, per-OID home location.
///
/// Migration writes one of these for every object of a generation. Writing
/// the same object twice leaves the store unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeObject {
    pub oid: Oid,
    pub alloc_count: ObCount,
    pub call_count: ObCount,
    pub body: HomeBody,
}

impl HomeObject {
    pub fn page(oid: Oid, alloc_count: ObCount, page: &PageBuf) -> Self {
        Self {
            oid,
            alloc_count,
            call_count: 0,
            body: HomeBody::Page(page.as_bytes().to_vec()),
        }
    }

    pub fn node(oid: Oid, alloc_count: ObCount, call_count: ObCount, data: NodeData) -> Self {
        Self {
            oid,
            alloc_count,
            call_count,
            body: HomeBody::Node(data),
        }
    }

    pub fn base_type(&self) -> BaseType {
        match self.body {
            HomeBody::Page(_) => BaseType::Page,
            HomeBody::Node(_) => BaseType::Node,
        }
    }

    /// Page contents, if this is a page.
    pub fn page_buf(&self) -> Option<PageBuf> {
        match &self.body {
            HomeBody::Page(bytes) => Some(PageBuf::from_slice(bytes)),
            HomeBody::Node(_) => None,
        }
    }
}
