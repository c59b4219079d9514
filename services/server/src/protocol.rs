// Frame kinds and field names of the wire protocol.

pub mod frames {
    pub const CONNECT: &str = "CONNECT";
    pub const RESPONSE: &str = "RESPONSE";
    pub const PUBLISH: &str = "PUBLISH";
    pub const SUBSCRIBE: &str = "SUBSCRIBE";
    pub const SUBRESPONSE: &str = "SUBRESPONSE";
    pub const SUBCLOSE: &str = "SUBCLOSE";
    pub const UNSUBSCRIBE: &str = "UNSUBSCRIBE";
    pub const ACKEV: &str = "ACKEV";
    pub const RECEV: &str = "RECEV";
    pub const QUERY: &str = "QUERY";
    pub const QUERYRESULT: &str = "QUERYRESULT";
    pub const QUERYACK: &str = "QUERYACK";
    pub const PING: &str = "PING";
    pub const STARTTX: &str = "STARTTX";
    pub const COMMITTX: &str = "COMMITTX";
    pub const ABORTTX: &str = "ABORTTX";
}

pub mod fields {
    pub const OK: &str = "ok";
    pub const ERRMSG: &str = "errMsg";
    pub const CHANNEL: &str = "channel";
    pub const EVENT: &str = "event";
    pub const TIMESTAMP: &str = "timestamp";
    pub const STARTPOS: &str = "startPos";
    pub const STARTTIMESTAMP: &str = "startTimestamp";
    pub const DURABLEID: &str = "durableID";
    pub const MATCHER: &str = "matcher";
    pub const SUBID: &str = "subID";
    pub const BYTES: &str = "bytes";
    pub const POS: &str = "pos";
    pub const QUERYID: &str = "queryID";
    pub const BINDER: &str = "binder";
    pub const DOCID: &str = "docID";
    pub const NAME: &str = "name";
    pub const PARAMS: &str = "params";
    pub const RESULT: &str = "result";
    pub const LAST: &str = "last";
}
