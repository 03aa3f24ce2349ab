use itertools::Itertools;

pub mod address;
pub mod local_auth;
pub mod locality;
pub mod parcel;
pub mod place_name;
pub mod road;
pub mod site;

/// Detail queries are restricted to bounded IRI chunks; narrow entities take
/// larger chunks than the wide address query.
pub const ADDRESS_CHUNK_SIZE: usize = 5_000;
pub const ENTITY_CHUNK_SIZE: usize = 10_000;

/// The fixed parcel set debug runs are restricted to.
pub const DEBUG_PARCEL_IRIS: &[&str] = &[
    "https://linked.data.gov.au/dataset/qld-addr/parcel/59SP217152",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/58SP217152",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/57SP217152",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/2SP217150",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/1SP217150",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/0SP217149",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/2SP217149",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/1SP217149",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/17SP217147",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/16SP217147",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/235RP33643",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/1SP101578",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/2RP141728",
    "https://linked.data.gov.au/dataset/qld-addr/parcel/41SP317569",
];

pub(crate) fn iri_values_block(iris: &[String]) -> String {
    iris.iter().map(|iri| format!("        <{iri}>")).join("\n")
}

pub(crate) fn debug_parcel_values_block() -> String {
    DEBUG_PARCEL_IRIS
        .iter()
        .map(|iri| format!("        <{iri}>"))
        .join("\n")
}
