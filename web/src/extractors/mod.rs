pub(crate) mod connection_headers;
