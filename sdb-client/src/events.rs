// SDB event handling
//
// The agent pushes composite event packets (set 64, command 100). Every
// event carries its kind, the request id that produced it and the thread it
// happened on, followed by a kind-specific payload.

use crate::commands::event_kinds;
use crate::protocol::SdbResult;
use crate::reader::{read_count, read_i32, read_i64, read_id, read_string, read_u8};
use crate::types::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

/// Single event within an event set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    pub thread: ThreadId,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart {
        domain: DomainId,
    },
    VMDeath,
    ThreadStart,
    ThreadDeath,
    AppDomainCreate {
        domain: DomainId,
    },
    AppDomainUnload {
        domain: DomainId,
    },
    MethodEntry {
        method: MethodId,
    },
    MethodExit {
        method: MethodId,
    },
    AssemblyLoad {
        assembly: AssemblyId,
    },
    AssemblyUnload {
        assembly: AssemblyId,
    },
    Breakpoint {
        location: Location,
    },
    Step {
        location: Location,
    },
    TypeLoad {
        type_id: TypeId,
    },
    Exception {
        exception: ObjectId,
    },
    KeepAlive,
    UserBreak,
    UserLog {
        level: i32,
        category: String,
        message: String,
    },
    Unknown {
        kind: u8,
    },
}

impl EventSet {
    /// True when the agent suspended the VM before sending this set
    pub fn suspends(&self) -> bool {
        self.suspend_policy != 0
    }
}

/// Parse the payload of a composite event packet
pub fn parse_event_packet(data: &[u8]) -> SdbResult<EventSet> {
    let mut buf = data;

    let suspend_policy = read_u8(&mut buf)?;
    let event_count = read_count(&mut buf)?;

    let mut events = Vec::with_capacity(event_count);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;
        let thread = read_id(&mut buf)?;

        let details = match kind {
            event_kinds::VM_START => EventKind::VMStart {
                domain: read_id(&mut buf)?,
            },
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::THREAD_START => EventKind::ThreadStart,
            event_kinds::THREAD_DEATH => EventKind::ThreadDeath,
            event_kinds::APPDOMAIN_CREATE => EventKind::AppDomainCreate {
                domain: read_id(&mut buf)?,
            },
            event_kinds::APPDOMAIN_UNLOAD => EventKind::AppDomainUnload {
                domain: read_id(&mut buf)?,
            },
            event_kinds::METHOD_ENTRY => EventKind::MethodEntry {
                method: read_id(&mut buf)?,
            },
            event_kinds::METHOD_EXIT => EventKind::MethodExit {
                method: read_id(&mut buf)?,
            },
            event_kinds::ASSEMBLY_LOAD => EventKind::AssemblyLoad {
                assembly: read_id(&mut buf)?,
            },
            event_kinds::ASSEMBLY_UNLOAD => EventKind::AssemblyUnload {
                assembly: read_id(&mut buf)?,
            },
            event_kinds::BREAKPOINT => EventKind::Breakpoint {
                location: read_location(&mut buf)?,
            },
            event_kinds::STEP => EventKind::Step {
                location: read_location(&mut buf)?,
            },
            event_kinds::TYPE_LOAD => EventKind::TypeLoad {
                type_id: read_id(&mut buf)?,
            },
            event_kinds::EXCEPTION => EventKind::Exception {
                exception: read_id(&mut buf)?,
            },
            event_kinds::KEEPALIVE => EventKind::KeepAlive,
            event_kinds::USER_BREAK => EventKind::UserBreak,
            event_kinds::USER_LOG => EventKind::UserLog {
                level: read_i32(&mut buf)?,
                category: read_string(&mut buf)?,
                message: read_string(&mut buf)?,
            },
            _ => {
                // Payload length is unknown, nothing after this can be trusted
                warn!("Unsupported event kind: {}", kind);
                events.push(Event {
                    kind,
                    request_id,
                    thread,
                    details: EventKind::Unknown { kind },
                });
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            thread,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}

/// Read a location from the buffer
fn read_location(buf: &mut &[u8]) -> SdbResult<Location> {
    let method = read_id(buf)?;
    let il_offset = read_i64(buf)?;

    Ok(Location { method, il_offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::put_string;
    use bytes::BufMut;

    #[test]
    fn test_parse_breakpoint_and_log() {
        let mut data = Vec::new();
        data.put_u8(2); // suspend all
        data.put_i32(2);

        data.put_u8(event_kinds::BREAKPOINT);
        data.put_i32(5);
        data.put_u32(1);
        data.put_u32(300);
        data.put_i64(0x1c);

        data.put_u8(event_kinds::USER_LOG);
        data.put_i32(0);
        data.put_u32(1);
        data.put_i32(3);
        put_string(&mut data, "cat");
        put_string(&mut data, "hello");

        let set = parse_event_packet(&data).unwrap();
        assert!(set.suspends());
        assert_eq!(set.events.len(), 2);
        assert_eq!(set.events[0].request_id, 5);
        assert_eq!(set.events[0].thread, 1);
        assert_eq!(
            set.events[0].details,
            EventKind::Breakpoint {
                location: Location {
                    method: 300,
                    il_offset: 0x1c
                }
            }
        );
        assert_eq!(
            set.events[1].details,
            EventKind::UserLog {
                level: 3,
                category: "cat".to_string(),
                message: "hello".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_vm_lifecycle() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(2);
        data.put_u8(event_kinds::VM_START);
        data.put_i32(0);
        data.put_u32(1);
        data.put_u32(9);
        data.put_u8(event_kinds::VM_DEATH);
        data.put_i32(0);
        data.put_u32(0);

        let set = parse_event_packet(&data).unwrap();
        assert!(!set.suspends());
        assert_eq!(set.events[0].details, EventKind::VMStart { domain: 9 });
        assert_eq!(set.events[1].details, EventKind::VMDeath);
    }

    #[test]
    fn test_unknown_kind_stops_parsing() {
        let mut data = Vec::new();
        data.put_u8(0);
        data.put_i32(2);
        data.put_u8(99);
        data.put_i32(0);
        data.put_u32(1);
        data.put_u8(0xff);

        let set = parse_event_packet(&data).unwrap();
        assert_eq!(set.events.len(), 1);
        assert_eq!(set.events[0].details, EventKind::Unknown { kind: 99 });
    }
}
