use itertools::Itertools;

use super::debug_parcel_values_block;

/// One address occurrence with everything the detail query needs bound up
/// front: the address and parcel IRIs plus the road tuple its road id is
/// derived from. The detail query re-matches the tuple against the graph, so
/// an occurrence whose road or locality association changed since the
/// iris-only fetch drops out instead of landing with stale bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressKey {
    pub addr_iri: String,
    pub parcel_id: String,
    pub road: String,
    pub locality_code: String,
    pub road_name: String,
}

/// Distinct address occurrences, optionally restricted to the debug parcel
/// set.
pub fn get_query_iris_only(debug: bool) -> String {
    let values = match debug {
        true => format!(
            "    VALUES ?parcel_id {{\n{}\n    }}\n\n",
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

SELECT DISTINCT ?addr_iri ?parcel_id ?road ?locality_code ?_road_name
WHERE {{
{values}    GRAPH <urn:qali:graph:addresses> {{
        ?parcel_id a addr:AddressableObject ;
            cn:hasName ?addr_iri .

        ?addr_iri a addr:Address .

        # Road
        ?addr_iri sdo:hasPart [
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
            BIND(UCASE(?_road_name) as ?road_name)
        }}
    }}
}}"#
    )
}

fn key_values_block(keys: &[AddressKey]) -> String {
    keys.iter()
        .map(|key| {
            format!(
                "        (<{}> <{}> <{}> \"{}\" \"{}\")",
                key.addr_iri, key.parcel_id, key.road, key.locality_code, key.road_name
            )
        })
        .join("\n")
}

/// Address details for one chunk of address keys.
pub fn get_query(keys: &[AddressKey]) -> String {
    let values = key_values_block(keys);
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX apt: <https://linked.data.gov.au/def/addr-part-types/>
PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX rnpt: <https://linked.data.gov.au/def/road-name-part-types/>
PREFIX sdo: <https://schema.org/>
PREFIX skos: <http://www.w3.org/2004/02/skos/core#>

SELECT
    ?parcel_id
    ?addr_id
    ?address_pid
    ?addr_status_code
    ?unit_type
    ?unit_no
    ?unit_suffix
    ?level_type
    ?level_no
    ?level_suffix
    ?street_no_first
    ?street_no_first_suffix
    ?street_no_last
    ?street_no_last_suffix
    ?road_id
    ?site_id
    ?location_desc
    ?address_standard
WHERE {{
    VALUES (?addr_iri ?parcel_id ?road ?locality_code ?_road_name) {{
{values}
    }}

    GRAPH <urn:qali:graph:addresses> {{
        ?parcel_id a addr:AddressableObject ;
            cn:hasName ?addr_iri .

        ?addr_iri a addr:Address ;
            sdo:identifier ?address_pid ;
            addr:hasStatus ?addr_status .
        FILTER(DATATYPE(?address_pid) = <https://linked.data.gov.au/dataset/qld-addr/datatype/address-pid>)

        # addr id
        BIND(CONCAT(STR(?addr_iri), "/", ?road_id, "/", STR(?parcel_id)) AS ?addr_id)

        # addr status code
        GRAPH ?addr_status_vocab_graph {{
            ?addr_status skos:notation ?addr_status_code .
            FILTER(DATATYPE(?addr_status_code) = <https://linked.data.gov.au/dataset/qld-addr/datatype/sir-pub>)
        }}

        # unit type
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:subaddressType ;
                sdo:value ?unit_type_concept
            ] .

            GRAPH ?unit_type_graph {{
                ?unit_type_concept skos:notation ?unit_type ;
                skos:inScheme <https://linked.data.gov.au/def/subaddress-types>
                FILTER(DATATYPE(?unit_type) = <https://linked.data.gov.au/dataset/qld-addr/datatype/sir-pub>)
            }}
        }}

        # unit no
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:subaddressNumber ;
                sdo:value ?unit_no
            ]
        }}

        # unit suffix
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:subaddressNumberSuffix ;
                sdo:value ?unit_suffix
            ]
        }}

        # level type
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:buildingLevelType ;
                sdo:value ?level_type_concept
            ] .

            GRAPH ?level_type_graph {{
                ?level_type_concept skos:prefLabel ?level_type ;
                skos:inScheme <https://linked.data.gov.au/def/building-level-types>
            }}
        }}

        # level no
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:buildingLevelNumber ;
                sdo:value ?level_no
            ] .
        }}

        # level suffix
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:buildingLevelSuffix ;
                sdo:value ?level_suffix
            ] .
        }}

        # street no first
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:addressNumberFirst ;
                sdo:value ?street_no_first
            ]
        }}

        # street no first suffix
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:addressNumberFirstSuffix ;
                sdo:value ?street_no_first_suffix
            ]
        }}

        # street no last
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:addressNumberLast ;
                sdo:value ?street_no_last
            ]
        }}

        # street no last suffix
        OPTIONAL {{
            ?addr_iri sdo:hasPart [
                    sdo:additionalType apt:addressNumberLastSuffix ;
                sdo:value ?street_no_last_suffix
            ]
        }}

        # road
        ?addr_iri sdo:hasPart [
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
            BIND(UCASE(?_road_name) as ?road_name)
        }}

        # road id
        BIND(CONCAT(STR(?road), "/", ?locality_code, "/", ?road_name) AS ?road_id)

        # site
        BIND(CONCAT(STR(?parcel_id), "|", STR(?addr_iri)) AS ?site_id)

        # address standard
        ?addr_iri sdo:additionalType ?address_standard_concept .
        GRAPH ?address_standard_vocab_graph {{
            ?address_standard_concept skos:notation ?address_standard ;
            skos:inScheme <https://linked.data.gov.au/def/addr-classes> .
            FILTER(DATATYPE(?address_standard) = <https://linked.data.gov.au/dataset/qld-addr/datatype/sir-pub>)
        }}
    }}
}}"#
    )
}
