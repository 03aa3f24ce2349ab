/// Distinct local authorities, keyed by the LALF la_code.
pub fn get_query() -> String {
    r#"PREFIX cn: <https://linked.data.gov.au/def/cn/>
PREFIX gn: <https://linked.data.gov.au/def/gn/>
PREFIX sdo: <https://schema.org/>

SELECT DISTINCT ?la_code ?lga_name
WHERE {
    GRAPH <urn:qali:graph:geographical-names> {
        ?iri a gn:GeographicalName ;
        cn:isNameFor ?geographic_object .

        ?geographic_object sdo:additionalType <https://linked.data.gov.au/def/go-categories/locality> .

        ?iri sdo:additionalProperty [
            sdo:propertyID "lalf.la_code" ;
            sdo:value ?la_code
        ] ,
        [
            sdo:propertyID "pndb.lga_name" ;
            sdo:value ?lga_name
        ]
    }
}"#
    .to_string()
}
