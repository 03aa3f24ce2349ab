use itertools::Itertools;

use super::debug_parcel_values_block;

/// One road occurrence: the road name IRI in one locality. The published
/// road id is derived from all three parts.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadKey {
    pub road: String,
    pub locality_code: String,
    pub road_name: String,
}

/// Distinct (road, locality, name) tuples reachable from current addresses,
/// optionally restricted to the debug parcel set.
pub fn get_query_iris_only(debug: bool) -> String {
    let values = match debug {
        true => format!(
            "        VALUES ?parcel_id {{\n{}\n        }}\n\n        ?parcel_id a addr:AddressableObject ;\n            cn:hasName ?iri .\n",
            debug_parcel_values_block()
        ),
        false => String::new(),
    };
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX apt: <https://linked.data.gov.au/def/addr-part-types/>
PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX rnpt: <https://linked.data.gov.au/def/road-name-part-types/>
PREFIX sdo: <https://schema.org/>
PREFIX skos: <http://www.w3.org/2004/02/skos/core#>

SELECT DISTINCT ?road ?locality_code ?_road_name
WHERE {{
    GRAPH <urn:qali:graph:addresses> {{
{values}
        ?iri a addr:Address ;
        sdo:hasPart [
                sdo:additionalType apt:road ;
            sdo:value ?road
        ],
                [
                sdo:additionalType apt:locality ;
            sdo:value ?locality
        ] .

        # Locality
        GRAPH <urn:qali:graph:geographical-names> {{
            ?locality sdo:additionalProperty [
                    sdo:propertyID "lalf.locality_code" ;
                sdo:value ?locality_code
            ]
        }}

        GRAPH <urn:qali:graph:roads> {{
            # Road Name
            ?road sdo:hasPart [
                    sdo:additionalType rnpt:roadGivenName ;
                sdo:value ?_road_name
            ] .
        }}
    }}
}}"#
    )
}

fn key_values_block(keys: &[RoadKey]) -> String {
    keys.iter()
        .map(|key| {
            format!(
                "        (<{}> \"{}\" \"{}\")",
                key.road, key.locality_code, key.road_name
            )
        })
        .join("\n")
}

/// Road details for one chunk of road keys.
pub fn get_query(keys: &[RoadKey]) -> String {
    let values = key_values_block(keys);
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX apt: <https://linked.data.gov.au/def/addr-part-types/>
PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX roads: <https://linked.data.gov.au/def/roads/>
PREFIX rnpt: <https://linked.data.gov.au/def/road-name-part-types/>
PREFIX sdo: <https://schema.org/>
PREFIX skos: <http://www.w3.org/2004/02/skos/core#>

SELECT (CONCAT(STR(?road), "/", ?locality_code, "/", UCASE(?_road_name)) AS ?road_id) (UCASE(?_road_name) as ?road_name) ?road_name_suffix ?road_name_type ?locality_code ?road_cat_desc
WHERE {{

    VALUES (?road ?locality_code ?_road_name) {{
{values}
    }}

    GRAPH <urn:qali:graph:roads> {{
        ?road a roads:RoadName .

        # Road Suffix
        OPTIONAL {{
            ?road sdo:hasPart [
                    sdo:additionalType rnpt:roadSuffix ;
                sdo:value ?road_name_suffix_iri
            ] .

            GRAPH ?vocab_graph {{
                ?road_name_suffix_iri skos:notation ?road_name_suffix .
                FILTER(DATATYPE(?road_name_suffix) = <https://linked.data.gov.au/dataset/qld-addr/datatype/sir-pub>)
            }}
        }}

        # Road Type
        OPTIONAL {{
            ?road sdo:hasPart [
                    sdo:additionalType rnpt:roadType ;
                sdo:value ?road_name_type_iri
            ] .

            GRAPH ?vocab_graph {{
                ?road_name_type_iri skos:notation ?road_name_type
                FILTER(DATATYPE(?road_name_type) = <https://linked.data.gov.au/dataset/qld-addr/datatype/sir-pub>)
            }}
        }}
    }}

    BIND("P" as ?road_cat_desc)
}}"#
    )
}
