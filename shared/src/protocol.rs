/// mDNS service type for the bridge's own API advertisement
pub const BRIDGE_SERVICE_TYPE: &str = "_ua-discovery._tcp.local.";

/// mDNS service type OPC UA servers announce their binary TCP endpoints with
/// (multicast subnet discovery)
pub const OPCUA_TCP_SERVICE_TYPE: &str = "_opcua-tcp._tcp.local.";

/// TXT record keys used in bridge self-advertisement
pub const TXT_SUPERVISOR: &str = "supervisor";
pub const TXT_SITE: &str = "site";

/// TXT record key carrying the endpoint path of an announced server
pub const TXT_PATH: &str = "path";

/// Default OPC UA discovery port
pub const OPCUA_DEFAULT_PORT: u16 = 4840;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
