//! Route computation: chooses contacts for a bundle, decides whether to
//! fragment, and accounts contact capacity per priority class.

use crate::fragmenter;
use crate::node::{Contact, ContactId, CAPACITY_INFINITE};
use crate::routing_table::RoutingTable;
use bpa_proto::bundle::{Bundle, BundleUniqueId, RoutingPriority};
use bpa_proto::eid;
use bpa_proto::time::DtnTime;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info};

/// Tuning knobs of the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Global maximum bundle size per transmission.
    pub global_mbs: usize,
    /// Minimum payload bytes a fragment must carry to be worthwhile.
    pub fragment_min_payload: u64,
    /// Upper bound on the number of fragments per bundle.
    pub max_fragments: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            global_mbs: usize::MAX,
            fragment_min_payload: 8,
            max_fragments: 3,
        }
    }
}

/// Why no transmission slot could be committed for a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route to destination")]
    NoRoute,
    #[error("no timely contact to destination")]
    NoTimelyContact,
    #[error("out of memory while scheduling")]
    NoMemory,
    #[error("bundle lifetime expired")]
    Expired,
}

/// One planned fragment: the contact it is committed to and the payload
/// bytes it will carry.
#[derive(Debug, Clone, Copy)]
pub struct FragmentRoute {
    pub contact: ContactId,
    pub payload_size: u64,
}

/// A forwarding plan. A single entry means the bundle travels whole.
#[derive(Debug, Clone, Default)]
pub struct RouterPlan {
    pub fragments: SmallVec<[FragmentRoute; 4]>,
}

/// Resolver for the maximum bundle size of the CLA behind an address.
/// `None` means the CLA is unknown and its contacts are unusable.
pub type MbsResolver<'a> = &'a dyn Fn(&str) -> Option<usize>;

/// Contacts that may serve `destination`, ordered by end time: the
/// destination's node-ID entry is preferred, with a verbatim lookup as
/// fallback.
pub fn lookup_destination(table: &RoutingTable, destination: &str) -> Vec<ContactId> {
    if let Some(node_id) = eid::node_id_of(destination) {
        if let Some(contacts) = table.lookup_eid(&node_id) {
            return contacts.to_vec();
        }
    }
    table
        .lookup_eid(destination)
        .map(|c| c.to_vec())
        .unwrap_or_default()
}

fn cla_addr_of(table: &RoutingTable, contact: &Contact) -> Option<String> {
    let node_eid = contact.node_eid.as_deref()?;
    table.lookup_node(node_eid)?.cla_addr.clone()
}

struct MaxFragmentSize {
    max_fragment_size: u64,
    payload_capacity: u64,
}

/// Scans the candidate contacts and determines the largest reasonable
/// fragment size: the accumulated payload capacity must cover the whole
/// payload, and each usable contact caps the fragment size by its own
/// capacity, its CLA's maximum bundle size, and the global maximum.
#[allow(clippy::too_many_arguments)]
fn max_reasonable_fragment_size(
    table: &RoutingTable,
    contacts: &[ContactId],
    full_size: u64,
    max_fragment_min_size: u64,
    payload_size: u64,
    priority: RoutingPriority,
    now_ms: DtnTime,
    mbs_for: MbsResolver,
    config: &RouterConfig,
) -> MaxFragmentSize {
    let min_capacity = payload_size / config.max_fragments as u64 + max_fragment_min_size;
    let mut payload_capacity: u64 = 0;
    let mut max_frag_size = u64::MAX;

    for id in contacts {
        if payload_capacity >= payload_size {
            break;
        }
        let Some(contact) = table.contact(*id) else {
            continue;
        };
        let c_capacity = contact.remaining_capacity(priority, now_ms);
        if c_capacity < min_capacity as i64 {
            continue;
        }
        let Some(cla_addr) = cla_addr_of(table, contact) else {
            continue;
        };
        let Some(cla_mbs) = mbs_for(&cla_addr) else {
            continue;
        };
        let c_mbs = (c_capacity as u64)
            .min(cla_mbs as u64)
            .min(config.global_mbs as u64);
        if c_capacity >= CAPACITY_INFINITE {
            return MaxFragmentSize {
                max_fragment_size: c_mbs.min(CAPACITY_INFINITE as u64),
                payload_capacity: payload_size,
            };
        }
        let c_pay_capacity = c_capacity - max_fragment_min_size as i64;
        if c_pay_capacity > config.fragment_min_payload as i64 {
            payload_capacity += c_pay_capacity as u64;
            max_frag_size = max_frag_size.min(c_mbs);
            if c_capacity as u64 >= full_size {
                break;
            }
        }
    }
    MaxFragmentSize {
        max_fragment_size: if payload_capacity < payload_size {
            0
        } else {
            max_frag_size
        },
        payload_capacity,
    }
}

/// Finds a contact able to carry `size` more bytes, accounting for
/// `preprocessed_size` bytes already committed to earlier contacts in
/// this plan. Returns the chosen contact, or whether any timely contact
/// was seen at all.
fn calculate_fragment_route(
    table: &RoutingTable,
    size: u64,
    contacts: &[ContactId],
    mut preprocessed_size: u64,
    expiration_ms: DtnTime,
    now_ms: DtnTime,
    saw_timely: &mut bool,
) -> Option<ContactId> {
    for id in contacts {
        let Some(contact) = table.contact(*id) else {
            continue;
        };
        if contact.from_ms >= expiration_ms {
            continue;
        }
        if contact.to_ms <= now_ms {
            continue;
        }
        *saw_timely = true;
        let mut cap = contact.remaining_capacity(RoutingPriority::Low, now_ms).max(0) as u64;
        if preprocessed_size != 0 {
            if preprocessed_size >= cap {
                preprocessed_size -= cap;
                continue;
            }
            cap -= preprocessed_size;
        }
        if cap < size {
            preprocessed_size = 0;
            continue;
        }
        return Some(*id);
    }
    None
}

/// Computes a forwarding plan for the bundle over the current table.
pub fn get_first_route(
    table: &RoutingTable,
    bundle: &Bundle,
    config: &RouterConfig,
    mbs_for: MbsResolver,
    now_ms: DtnTime,
) -> Result<RouterPlan, RouteError> {
    let destination = bundle.destination.as_deref().ok_or(RouteError::NoRoute)?;
    let expiration_ms = bundle.expiration_time_ms(now_ms);
    let contacts = lookup_destination(table, destination);
    if contacts.is_empty() {
        info!(destination, "no known node serves the destination");
        return Err(RouteError::NoRoute);
    }

    let bundle_size = bundle.serialized_size() as u64;
    let payload_size = bundle.payload_length();
    let first_frag_size = bundle.first_fragment_min_size() as u64;
    let last_frag_size = bundle.last_fragment_min_size() as u64;
    let priority = bundle.routing_priority();

    let mrfs = max_reasonable_fragment_size(
        table,
        &contacts,
        bundle_size,
        first_frag_size.max(last_frag_size),
        payload_size,
        priority,
        now_ms,
        mbs_for,
        config,
    );
    if mrfs.max_fragment_size == 0 {
        debug!(
            payload_capacity = mrfs.payload_capacity,
            bundle_size, "contact payload capacity too low"
        );
        return Err(RouteError::NoRoute);
    }

    let mut saw_timely = false;
    let mut plan = RouterPlan::default();

    if bundle.must_not_fragment() || bundle_size <= mrfs.max_fragment_size {
        if let Some(contact) = calculate_fragment_route(
            table,
            bundle_size,
            &contacts,
            0,
            expiration_ms,
            now_ms,
            &mut saw_timely,
        ) {
            plan.fragments.push(FragmentRoute {
                contact,
                payload_size,
            });
        }
    } else if !bundle.must_not_fragment() {
        plan = plan_fragments(
            table,
            bundle,
            config,
            &contacts,
            mrfs.max_fragment_size,
            first_frag_size,
            last_frag_size,
            expiration_ms,
            now_ms,
            &mut saw_timely,
        )
        .unwrap_or_default();
    }

    if plan.fragments.is_empty() {
        info!(
            destination,
            bundle_size, "no feasible route found for bundle"
        );
        if saw_timely {
            Err(RouteError::NoRoute)
        } else {
            Err(RouteError::NoTimelyContact)
        }
    } else {
        Ok(plan)
    }
}

#[allow(clippy::too_many_arguments)]
fn plan_fragments(
    table: &RoutingTable,
    bundle: &Bundle,
    config: &RouterConfig,
    contacts: &[ContactId],
    max_frag_size: u64,
    first_frag_size: u64,
    last_frag_size: u64,
    expiration_ms: DtnTime,
    now_ms: DtnTime,
    saw_timely: &mut bool,
) -> Option<RouterPlan> {
    let mid_frag_size = bundle.mid_fragment_min_size() as u64;
    let mut next_frag_size = first_frag_size;
    if next_frag_size > max_frag_size || last_frag_size > max_frag_size {
        info!(
            max_frag_size,
            first_frag_size, mid_frag_size, last_frag_size,
            "cannot fragment, headers exceed maximum fragment size"
        );
        return None;
    }

    // Greedy left-to-right payload assignment.
    let mut payload_sizes: SmallVec<[u64; 4]> = SmallVec::new();
    let mut remaining = bundle.payload_length();
    while remaining != 0 && payload_sizes.len() < config.max_fragments {
        let min_payload = remaining.min(config.fragment_min_payload);
        let max_payload = max_frag_size - next_frag_size;
        if max_payload < min_payload {
            info!(
                min_payload,
                max_payload, "fragment cannot carry the minimum payload"
            );
            break;
        }
        if remaining <= max_frag_size - last_frag_size {
            payload_sizes.push(remaining);
            remaining = 0;
        } else {
            let chunk = remaining.min(max_payload);
            payload_sizes.push(chunk);
            remaining -= chunk;
            next_frag_size = mid_frag_size;
        }
    }
    if remaining != 0 {
        return None;
    }

    // Route every fragment, spilling already-committed sizes forward.
    let count = payload_sizes.len();
    let mut plan = RouterPlan::default();
    let mut processed: u64 = 0;
    for (i, payload) in payload_sizes.iter().enumerate() {
        let header = if i == 0 {
            first_frag_size
        } else if i == count - 1 {
            last_frag_size
        } else {
            mid_frag_size
        };
        let size = payload + header;
        let contact = calculate_fragment_route(
            table,
            size,
            contacts,
            processed,
            expiration_ms,
            now_ms,
            saw_timely,
        )?;
        plan.fragments.push(FragmentRoute {
            contact,
            payload_size: *payload,
        });
        processed += size;
    }
    Some(plan)
}

// Capacity accounting ---------------------------------------------------

fn apply_capacity(contact: &mut Contact, size: i64, priority: RoutingPriority) {
    if contact.is_infinite() {
        return;
    }
    contact.remaining[0] -= size;
    if priority > RoutingPriority::Low {
        contact.remaining[1] -= size;
        if priority != RoutingPriority::Normal {
            contact.remaining[2] -= size;
        }
    }
}

/// Appends a bundle to a contact's FIFO transmission queue and deducts
/// its serialized size from the capacity counters.
pub fn add_bundle_to_contact(contact: &mut Contact, bundle: Bundle) {
    let size = bundle.serialized_size() as i64;
    let priority = bundle.routing_priority();
    contact.bundles.push(bundle);
    apply_capacity(contact, size, priority);
}

/// Removes the bundle matching `id` from a contact, restoring its
/// capacity counters.
pub fn remove_bundle_from_contact(
    contact: &mut Contact,
    id: &BundleUniqueId,
) -> Option<Bundle> {
    let pos = contact.bundles.iter().position(|b| b.matches_id(id))?;
    let bundle = contact.bundles.remove(pos);
    apply_capacity(contact, -(bundle.serialized_size() as i64), bundle.routing_priority());
    Some(bundle)
}

/// Empties a contact's transmission queue, restoring its capacity.
pub fn drain_bundles(contact: &mut Contact) -> Vec<Bundle> {
    let bundles = std::mem::take(&mut contact.bundles);
    for bundle in &bundles {
        apply_capacity(
            contact,
            -(bundle.serialized_size() as i64),
            bundle.routing_priority(),
        );
    }
    bundles
}

/// Computes a route for the bundle and commits it (or its fragments) to
/// the chosen contacts. On failure the bundle is handed back together
/// with the reason.
pub fn route_bundle(
    table: &mut RoutingTable,
    config: &RouterConfig,
    mbs_for: MbsResolver,
    bundle: Bundle,
    now_ms: DtnTime,
) -> Result<usize, (Bundle, RouteError)> {
    if bundle.expiration_time_ms(now_ms) < now_ms {
        return Err((bundle, RouteError::Expired));
    }
    let plan = match get_first_route(table, &bundle, config, mbs_for, now_ms) {
        Ok(plan) => plan,
        Err(e) => return Err((bundle, e)),
    };

    if plan.fragments.len() == 1 {
        let id = plan.fragments[0].contact;
        let Some(contact) = table.contact_mut(id) else {
            return Err((bundle, RouteError::NoMemory));
        };
        add_bundle_to_contact(contact, bundle);
        return Ok(1);
    }

    // Only fragment when allowed; otherwise the plan would have failed.
    debug_assert!(!bundle.must_not_fragment());
    // The table is not mutated between planning and commitment, so all
    // planned contacts must still exist.
    if plan.fragments.iter().any(|f| table.contact(f.contact).is_none()) {
        return Err((bundle, RouteError::NoMemory));
    }
    let fragments = match fragmenter::apply_fragmentation(bundle, &plan) {
        Ok(f) => f,
        Err(bundle) => return Err((bundle, RouteError::NoMemory)),
    };
    let count = fragments.len();
    for (fragment, route) in fragments.into_iter().zip(plan.fragments.iter()) {
        let contact = table
            .contact_mut(route.contact)
            .expect("contact validated above");
        add_bundle_to_contact(contact, fragment);
    }
    Ok(count)
}
