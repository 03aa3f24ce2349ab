use super::iri_values_block;

/// Sites for one chunk of parcel IRIs. A site is the pairing of a parcel
/// with one of its addresses; the parent site cannot be derived from the
/// data, as some balance lotplans carry multiple primary addresses.
pub fn get_query(parcel_iris: &[String]) -> String {
    let values = iri_values_block(parcel_iris);
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX sdo: <https://schema.org/>

SELECT (CONCAT(STR(?parcel_id), "|", STR(?address)) AS ?site_id) ?parent_site_id ?site_type ?parcel_id
WHERE {{
    VALUES ?parcel_id {{
{values}
    }}

    GRAPH <urn:qali:graph:addresses> {{
        ?parcel_id a addr:AddressableObject ;
        sdo:identifier ?plan_no, ?_lot_no .

        FILTER(DATATYPE(?plan_no) = <https://linked.data.gov.au/dataset/qld-addr/datatype/plan>)
        FILTER(DATATYPE(?_lot_no) = <https://linked.data.gov.au/dataset/qld-addr/datatype/lot>).

        ?parcel_id cn:hasName ?address .
        ?address a addr:Address .

        BIND("P" AS ?site_type)
    }}
}}
ORDER BY ?parcel_id ?parent_site_id"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_id_is_parcel_and_address() {
        let query = get_query(&["https://example.com/parcel/1".to_string()]);
        assert!(query.contains(r#"CONCAT(STR(?parcel_id), "|", STR(?address))"#));
        assert!(query.contains("<https://example.com/parcel/1>"));
    }
}
