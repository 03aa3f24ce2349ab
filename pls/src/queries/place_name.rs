use itertools::Itertools;

/// The (parcel, address) pairing a place name hangs off.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceNameKey {
    pub parcel_id: String,
    pub addr_iri: String,
}

/// Place names for one chunk of (parcel, address) pairs.
pub fn get_query(keys: &[PlaceNameKey]) -> String {
    let values = keys
        .iter()
        .map(|key| format!("            (<{}> <{}>)", key.parcel_id, key.addr_iri))
        .join("\n");
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX apt: <https://linked.data.gov.au/def/addr-part-types/>
PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX sdo: <https://schema.org/>

SELECT
    (CONCAT(STR(?_place_name_id), "|", STR(?parcel_id), "|", STR(?addr_iri)) AS ?place_name_id)
    ("P" AS ?pl_name_status_code)
    ("PROP" AS ?pl_name_type_code)
    ?pl_name
    (CONCAT(STR(?parcel_id), "|", STR(?addr_iri)) AS ?site_id)
WHERE {{
    GRAPH <urn:qali:graph:addresses> {{
        VALUES (?parcel_id ?addr_iri) {{
{values}
        }}

        # property name
        ?addr_iri sdo:hasPart [
                sdo:additionalType apt:propertyName ;
            sdo:value ?_place_name_id
        ]

        GRAPH <urn:qali:graph:geographical-names> {{
            ?_place_name_id sdo:name ?pl_name
        }}
    }}
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_embeds_parcel_address_pairs() {
        let keys = vec![PlaceNameKey {
            parcel_id: "https://example.com/parcel/1".to_string(),
            addr_iri: "https://example.com/addr/1".to_string(),
        }];
        let query = get_query(&keys);
        assert!(query.contains("(<https://example.com/parcel/1> <https://example.com/addr/1>)"));
    }
}
