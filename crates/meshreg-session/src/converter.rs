//! Payload construction: scope filtering and datum merging.

use std::collections::BTreeMap;
use std::sync::Arc;

use meshreg_core::{ClientVersion, Datum, Scope, Subscriber};

use crate::push::PushPayload;

/// Data-center name carried by merged datums.
pub const MERGED_DATA_CENTER: &str = "merged";

/// Datums visible to a subscriber of `scope`.
///
/// Data-center scope only sees the local data center. Zone scope sees
/// every data center but only publishers in the subscriber's zone.
/// Global scope sees everything.
pub fn datums_for_scope(
    datums: &BTreeMap<String, Arc<Datum>>,
    scope: Scope,
    zone: &str,
    local_data_center: &str,
) -> BTreeMap<String, Datum> {
    datums
        .iter()
        .filter(|(dc, _)| scope != Scope::DataCenter || dc.as_str() == local_data_center)
        .map(|(dc, datum)| {
            let visible = match scope {
                Scope::Zone => filter_zone(datum, zone),
                Scope::DataCenter | Scope::Global => (**datum).clone(),
            };
            (dc.clone(), visible)
        })
        .collect()
}

/// A copy of `datum` with only the publishers of `zone`.
pub fn filter_zone(datum: &Datum, zone: &str) -> Datum {
    Datum {
        publishers: datum
            .publishers
            .iter()
            .filter(|(_, p)| p.zone == zone)
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect(),
        ..datum.clone()
    }
}

/// Merge datums from several data centers into one.
///
/// The result holds the union of all publishers and the highest version.
/// A publisher present in more than one data center keeps the copy from
/// the datum with the higher version.
pub fn merge_datums<'a>(data_info_id: &str, datums: impl IntoIterator<Item = &'a Datum>) -> Datum {
    let mut sorted: Vec<&Datum> = datums.into_iter().collect();
    sorted.sort_by_key(|d| d.version);

    let mut merged = Datum::new(data_info_id, MERGED_DATA_CENTER, 0);
    for datum in sorted {
        merged.version = merged.version.max(datum.version);
        for (id, publisher) in &datum.publishers {
            merged.publishers.insert(id.clone(), publisher.clone());
        }
    }
    merged
}

/// Build the push payload for one address, shaped by the representative
/// subscriber's protocol version and scope.
///
/// Legacy zone-scope clients cannot filter by zone themselves and get the
/// merge of every data center's full datum, publishers of other zones
/// included.
pub fn build_payload(
    data_info_id: &str,
    representative: &Subscriber,
    datums: &BTreeMap<String, Arc<Datum>>,
    local_data_center: &str,
) -> PushPayload {
    let scope = representative.scope;
    if let (ClientVersion::MergeDatum, Scope::Zone) = (representative.client_version, scope) {
        return PushPayload::Merged(merge_datums(data_info_id, datums.values().map(|d| d.as_ref())));
    }

    let visible = datums_for_scope(datums, scope, &representative.zone, local_data_center);
    match representative.client_version {
        ClientVersion::StoreData => PushPayload::MultiDataCenter(visible),
        ClientVersion::MergeDatum => PushPayload::MultiDatum(visible.into_values().collect()),
    }
}
