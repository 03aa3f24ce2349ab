use std::env;

/// The query/applyEdits URL pair for one feature-service layer.
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    pub query: String,
    pub apply_edits: String,
}

/// MinIO/LocalStack profile used when running against local test
/// infrastructure instead of AWS. Application code assumes a role when
/// running in AWS.
#[derive(Debug, Clone)]
pub struct TestAwsProfile {
    pub s3_endpoint: String,
    pub lease_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Initializes and holds environment variable settings which control system
/// behavior. Panics if any required setting is not set.
#[derive(Debug)]
pub struct EnvConfigSettings {
    pub sparql_endpoint: String,
    pub esri_username: String,
    pub esri_password: String,
    pub esri_auth_url: String,
    pub esri_referer: String,

    pub sqlite_path: String,
    pub pls_sqlite_path: String,

    pub location_addressing_urls: ServiceUrls,
    pub geocode_urls: ServiceUrls,
    pub pls_local_auth_urls: ServiceUrls,
    pub pls_locality_urls: ServiceUrls,
    pub pls_road_urls: ServiceUrls,
    pub pls_parcel_urls: ServiceUrls,
    pub pls_site_urls: ServiceUrls,
    pub pls_address_urls: ServiceUrls,
    pub pls_geocode_urls: ServiceUrls,

    pub http_timeout_in_seconds: u64,
    pub http_retry_max_time_in_seconds: u64,

    pub s3_bucket_name: String,
    pub pls_s3_bucket_name: String,
    pub s3_presigned_url_expiry_seconds: u64,

    pub lock_table_name: String,

    pub test_aws_profile: Option<TestAwsProfile>,

    /// Caps the number of address IRIs pulled from the endpoint. Only used
    /// for testing.
    pub address_iri_limit: Option<usize>,
    /// Restricts SPARQL and geocode pulls to a fixed set of records.
    pub debug: bool,
}

const QPORTAL_REST: &str = "https://qportal.information.qld.gov.au/arcgis/rest/services/LOC";

fn required(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("Unable to parse {name} value {raw}!")),
        Err(_) => default,
    }
}

fn layer_urls(prefix: &str, service: &str, layer: u32) -> ServiceUrls {
    let base = var_or(
        &format!("{prefix}_URL_BASE"),
        &format!("{QPORTAL_REST}/{service}/FeatureServer/{layer}"),
    );
    ServiceUrls {
        query: var_or(&format!("{prefix}_QUERY_URL"), &format!("{base}/query")),
        apply_edits: var_or(&format!("{prefix}_APPLY_EDITS_URL"), &format!("{base}/applyEdits")),
    }
}

impl EnvConfigSettings {
    pub fn init() -> Self {
        let sparql_endpoint = required("ETL_SPARQL_ENDPOINT");
        let esri_username = required("ETL_ESRI_USERNAME");
        let esri_password = required("ETL_ESRI_PASSWORD");

        let test_aws_profile = match parse_or("ETL_USE_MINIO", false) {
            true => Some(TestAwsProfile {
                s3_endpoint: var_or("ETL_MINIO_ENDPOINT", "http://localhost:9000"),
                lease_endpoint: var_or("ETL_LOCALSTACK_ENDPOINT", "http://localhost:4566"),
                access_key: var_or("ETL_MINIO_ACCESS_KEY", "minioadmin"),
                secret_key: var_or("ETL_MINIO_SECRET_KEY", "minioadmin"),
                region: var_or("ETL_MINIO_REGION", "us-east-1"),
            }),
            false => None,
        };

        let address_iri_limit = env::var("ETL_ADDRESS_IRI_LIMIT")
            .ok()
            .map(|raw| raw.parse().unwrap_or_else(|_| panic!("Unable to parse ETL_ADDRESS_IRI_LIMIT value {raw}!")));

        Self {
            sparql_endpoint,
            esri_username,
            esri_password,
            esri_auth_url: var_or(
                "ETL_ESRI_AUTH_URL",
                "https://qportal.information.qld.gov.au/arcgis/sharing/rest/generateToken",
            ),
            esri_referer: var_or("ETL_ESRI_REFERER", "https://qportal.information.qld.gov.au/arcgis/"),
            sqlite_path: var_or("ETL_SQLITE_PATH", "address.db"),
            pls_sqlite_path: var_or("ETL_PLS_SQLITE_PATH", "pls.db"),
            location_addressing_urls: layer_urls(
                "ETL_ESRI_LOCATION_ADDRESSING",
                "Queensland_Location_Address_Maintenance_UAT",
                0,
            ),
            geocode_urls: layer_urls("ETL_ESRI_GEOCODE", "Address_Geocodes_UAT", 0),
            pls_local_auth_urls: layer_urls("ETL_ESRI_PLS_LOCAL_AUTH", "PLI_Tables_UAT", 7),
            pls_locality_urls: layer_urls("ETL_ESRI_PLS_LOCALITY", "PLI_Tables_UAT", 8),
            pls_road_urls: layer_urls("ETL_ESRI_PLS_ROAD", "PLI_Tables_UAT", 5),
            pls_parcel_urls: layer_urls("ETL_ESRI_PLS_PARCEL", "PLI_Tables_UAT", 3),
            pls_site_urls: layer_urls("ETL_ESRI_PLS_SITE", "PLI_Tables_UAT", 6),
            pls_address_urls: layer_urls("ETL_ESRI_PLS_ADDRESS", "PLI_Tables_UAT", 0),
            pls_geocode_urls: layer_urls("ETL_ESRI_PLS_GEOCODE", "PLI_Tables_UAT", 1),
            http_timeout_in_seconds: parse_or("ETL_HTTP_TIMEOUT_IN_SECONDS", 600),
            http_retry_max_time_in_seconds: parse_or("ETL_HTTP_RETRY_MAX_TIME_IN_SECONDS", 900),
            s3_bucket_name: var_or("ETL_S3_BUCKET_NAME", "location-addressing-feature-service-etl"),
            pls_s3_bucket_name: var_or("ETL_PLS_S3_BUCKET_NAME", "pls-feature-service-etl"),
            s3_presigned_url_expiry_seconds: parse_or("ETL_S3_PRESIGNED_URL_EXPIRY_SECONDS", 3600),
            lock_table_name: var_or("ETL_LOCK_TABLE_NAME", "address-etl-lock"),
            test_aws_profile,
            address_iri_limit,
            debug: parse_or("ETL_DEBUG", false),
        }
    }
}
