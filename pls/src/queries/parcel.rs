use super::{debug_parcel_values_block, iri_values_block};

/// All addressable-object IRIs, optionally restricted to the debug parcel
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

SELECT ?parcel_id
WHERE {{
{values}    GRAPH <urn:qali:graph:addresses> {{
        ?parcel_id a addr:AddressableObject .
    }}
}}"#
    )
}

/// Parcel details for one chunk of parcel IRIs. A lot of "0" is the balance
/// lot and is published as "9999".
pub fn get_query(iris: &[String]) -> String {
    let values = iri_values_block(iris);
    format!(
        r#"PREFIX addr: <https://linked.data.gov.au/def/addr/>
PREFIX sdo: <https://schema.org/>

SELECT ?parcel_id ?plan_no ?lot_no
WHERE {{
    VALUES ?parcel_id {{
{values}
    }}

    GRAPH <urn:qali:graph:addresses> {{
        ?parcel_id a addr:AddressableObject ;
        sdo:identifier ?plan_no, ?_lot_no .

        FILTER(DATATYPE(?plan_no) = <https://linked.data.gov.au/dataset/qld-addr/datatype/plan>)
        FILTER(DATATYPE(?_lot_no) = <https://linked.data.gov.au/dataset/qld-addr/datatype/lot>)

        # If it's a "0" with datatype of lot, then bind it as "9999"
        BIND(
            COALESCE(
                IF(
                    ?_lot_no = "0"^^<https://linked.data.gov.au/dataset/qld-addr/datatype/lot>,
                    "9999"^^<https://linked.data.gov.au/dataset/qld-addr/datatype/lot>,
                    1/0 # let it error to accept the default coalesce value
                ),
                ?_lot_no
            )
            AS ?lot_no
        )
    }}
}}"#
    )
}
