use crate::codec::Composed;
use crate::connection::ConnectionRole;
use crate::link::{Link, LinkDirection};
use indexmap::IndexMap;
use std::sync::{Mutex, Weak};
use weft::time::Uptime;

/// Fixed column set of the connection entity.
pub const CONNECTION_COLUMNS: [&str; 28] = [
    "identity",
    "name",
    "host",
    "role",
    "dir",
    "container",
    "sasl",
    "isAuthenticated",
    "user",
    "isEncrypted",
    "sslProto",
    "sslCipher",
    "properties",
    "sslSsf",
    "tenant",
    "opened",
    "active",
    "adminStatus",
    "operStatus",
    "uptimeSeconds",
    "lastDlvSeconds",
    "enableProtocolTrace",
    "annotationsVersion",
    "inboundLinks",
    "outboundLinks",
    "deliveriesIngress",
    "deliveriesEgress",
    "oversizeDenied",
];

/// Fixed column set of the link entity.
pub const LINK_COLUMNS: [&str; 28] = [
    "identity",
    "name",
    "linkType",
    "linkDir",
    "owningAddr",
    "capacity",
    "undeliveredCount",
    "unsettledCount",
    "deliveryCount",
    "presettledCount",
    "droppedPresettledCount",
    "acceptedCount",
    "rejectedCount",
    "releasedCount",
    "modifiedCount",
    "deliveriesDelayed1Sec",
    "deliveriesDelayed10Sec",
    "deliveriesStuck",
    "creditAvailable",
    "zeroCreditSeconds",
    "settleRate",
    "adminStatus",
    "operStatus",
    "priority",
    "peer",
    "connectionId",
    "ingressHistogram",
    "type",
];

pub const ADDRESS_COLUMNS: [&str; 8] = [
    "identity",
    "name",
    "distribution",
    "subscriberCount",
    "remoteCount",
    "deliveriesIngress",
    "deliveriesEgress",
    "priority",
];

pub const CONFIG_COLUMNS: [&str; 2] = ["name", "value"];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntityType {
    Connection,
    Link,
    Address,
    Config,
}

pub struct ConnectionRecord {
    pub id: u64,
    pub host: String,
    pub role: ConnectionRole,
    pub opened: u64,
    pub annotations_version: i32,
    pub inbound_links: u32,
    pub outbound_links: u32,
    pub deliveries_ingress: u64,
    pub deliveries_egress: u64,
    pub oversize_denied: u64,
}

pub struct LinkRecord {
    pub id: u64,
    pub connection_id: u64,
    pub owning_addr: String,
    pub priority: u8,
    /// Non-owning: the connection owns its links; the table only observes
    /// them.
    pub link: Weak<Mutex<Link>>,
}

pub struct AddressRecord {
    pub name: String,
    pub distribution: String,
    pub subscriber_count: u32,
    pub remote_count: u32,
    pub deliveries_ingress: u64,
    pub deliveries_egress: u64,
    pub priority: u8,
}

pub struct ConfigRecord {
    pub name: String,
    pub value: String,
}

/// The entity tables owned by the core thread. Walks are ordered by
/// insertion; there is no stable cursor across walks, callers pass the
/// next offset back in.
pub struct RouterTables {
    connections: IndexMap<u64, ConnectionRecord>,
    links: IndexMap<u64, LinkRecord>,
    addresses: IndexMap<String, AddressRecord>,
    configs: IndexMap<String, ConfigRecord>,
    uptime: Uptime,
}

impl RouterTables {
    pub fn new() -> RouterTables {
        RouterTables {
            connections: IndexMap::new(),
            links: IndexMap::new(),
            addresses: IndexMap::new(),
            configs: IndexMap::new(),
            uptime: Uptime::new(),
        }
    }

    pub fn connections_mut(&mut self) -> &mut IndexMap<u64, ConnectionRecord> {
        &mut self.connections
    }

    pub fn links_mut(&mut self) -> &mut IndexMap<u64, LinkRecord> {
        &mut self.links
    }

    pub fn addresses_mut(&mut self) -> &mut IndexMap<String, AddressRecord> {
        &mut self.addresses
    }

    pub fn configs_mut(&mut self) -> &mut IndexMap<String, ConfigRecord> {
        &mut self.configs
    }

    fn entity_len(&self, entity: EntityType) -> usize {
        match entity {
            EntityType::Connection => self.connections.len(),
            EntityType::Link => self.links.len(),
            EntityType::Address => self.addresses.len(),
            EntityType::Config => self.configs.len(),
        }
    }

    /// Begin a walk over one entity table, writing rows holding the
    /// requested column subset.
    pub fn walk<'t, 'c>(&'t self, entity: EntityType, columns: &'c [&'c str]) -> TableWalk<'t, 'c> {
        TableWalk {
            tables: self,
            entity,
            columns,
            index: 0,
        }
    }
}

/// An in-progress walk. Executed on the core thread; each row is one
/// composed AMQP list in requested-column order.
pub struct TableWalk<'t, 'c> {
    tables: &'t RouterTables,
    entity: EntityType,
    columns: &'c [&'c str],
    index: usize,
}

impl<'t, 'c> TableWalk<'t, 'c> {
    /// Position the walk and return the row at `offset`.
    pub fn get_first(&mut self, offset: usize) -> Option<Vec<u8>> {
        self.index = offset;
        self.get_next()
    }

    /// The next row, or `None` past the end of the table.
    pub fn get_next(&mut self) -> Option<Vec<u8>> {
        if self.index >= self.tables.entity_len(self.entity) {
            return None;
        }

        let row = self.write_row(self.index);
        self.index += 1;
        Some(row)
    }

    /// Offset the caller passes to resume a later walk.
    pub fn next_offset(&self) -> usize {
        self.index
    }

    fn write_row(&self, index: usize) -> Vec<u8> {
        let mut composed = Composed::new();
        composed.start_list();

        match self.entity {
            EntityType::Connection => {
                let (_, record) = self.tables.connections.get_index(index).expect("Row vanished mid-walk");
                for column in self.columns {
                    Self::connection_column(record, column, &mut composed);
                }
            }
            EntityType::Link => {
                let (_, record) = self.tables.links.get_index(index).expect("Row vanished mid-walk");
                let now_tick = self.tables.uptime.tick();
                for column in self.columns {
                    Self::link_column(record, column, now_tick, &mut composed);
                }
            }
            EntityType::Address => {
                let (_, record) = self.tables.addresses.get_index(index).expect("Row vanished mid-walk");
                for column in self.columns {
                    Self::address_column(record, column, &mut composed);
                }
            }
            EntityType::Config => {
                let (_, record) = self.tables.configs.get_index(index).expect("Row vanished mid-walk");
                for column in self.columns {
                    match *column {
                        "name" => composed.put_str(&record.name),
                        "value" => composed.put_str(&record.value),
                        _ => composed.put_null(),
                    }
                }
            }
        }

        composed.end();
        composed.into_vec()
    }

    fn connection_column(record: &ConnectionRecord, column: &str, composed: &mut Composed) {
        match column {
            "identity" => composed.put_ulong(record.id),
            "host" => composed.put_str(&record.host),
            "role" => composed.put_str(match record.role {
                ConnectionRole::Client => "normal",
                ConnectionRole::InterRouter => "inter-router",
                ConnectionRole::EdgeRouter => "edge",
            }),
            "opened" => composed.put_ulong(record.opened),
            "annotationsVersion" => composed.put_u32(record.annotations_version as u32),
            "inboundLinks" => composed.put_u32(record.inbound_links),
            "outboundLinks" => composed.put_u32(record.outbound_links),
            "deliveriesIngress" => composed.put_ulong(record.deliveries_ingress),
            "deliveriesEgress" => composed.put_ulong(record.deliveries_egress),
            "oversizeDenied" => composed.put_ulong(record.oversize_denied),
            _ => composed.put_null(),
        }
    }

    fn link_column(record: &LinkRecord, column: &str, now_tick: u64, composed: &mut Composed) {
        // The link may have been torn down since registration; the row
        // then reads as absent values.
        let link = record.link.upgrade();

        match column {
            "identity" => composed.put_ulong(record.id),
            "connectionId" => composed.put_ulong(record.connection_id),
            "owningAddr" => composed.put_str(&record.owning_addr),
            "priority" => composed.put_u32(u32::from(record.priority)),
            "type" => composed.put_str("org.apache.qpid.dispatch.router.link"),
            _ => match link {
                None => composed.put_null(),
                Some(link) => {
                    let mut link = link.lock().expect("Link lock poisoned");

                    match column {
                        "name" => composed.put_str(link.name()),
                        "linkDir" => composed.put_str(match link.direction() {
                            LinkDirection::Incoming => "in",
                            LinkDirection::Outgoing => "out",
                        }),
                        "undeliveredCount" => composed.put_u32(link.undelivered_count() as u32),
                        "unsettledCount" => composed.put_u32(link.unsettled_count() as u32),
                        "deliveryCount" => composed.put_ulong(link.delivered_count()),
                        "deliveriesDelayed1Sec" => composed.put_ulong(link.delayed_counts().0),
                        "deliveriesDelayed10Sec" => composed.put_ulong(link.delayed_counts().1),
                        "deliveriesStuck" => composed.put_bool(link.is_stuck()),
                        "creditAvailable" => composed.put_u32(link.credit()),
                        "zeroCreditSeconds" => composed.put_ulong(link.zero_credit_seconds(now_tick)),
                        // Advances the settle ring to the current tick
                        // before reading.
                        "settleRate" => composed.put_u32(link.settle_rate(now_tick)),
                        _ => composed.put_null(),
                    }
                }
            },
        }
    }

    fn address_column(record: &AddressRecord, column: &str, composed: &mut Composed) {
        match column {
            "identity" | "name" => composed.put_str(&record.name),
            "distribution" => composed.put_str(&record.distribution),
            "subscriberCount" => composed.put_u32(record.subscriber_count),
            "remoteCount" => composed.put_u32(record.remote_count),
            "deliveriesIngress" => composed.put_ulong(record.deliveries_ingress),
            "deliveriesEgress" => composed.put_ulong(record.deliveries_egress),
            "priority" => composed.put_u32(u32::from(record.priority)),
            _ => composed.put_null(),
        }
    }
}
