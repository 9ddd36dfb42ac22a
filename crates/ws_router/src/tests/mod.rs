use super::*;

use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use ws_proto::{
    meta, ErrorCode, MessageDescriptor, WsError, ERROR_TYPE, HEARTBEAT_ACK_TYPE, HEARTBEAT_TYPE,
    RPC_ERROR_TYPE, RPC_PROGRESS_TYPE,
};

use crate::testing::{ManualClock, MemorySocket};

mod support;
use support::*;

mod rpc_lifecycle;
