// sb-proto: Broker wire protocol and bus envelope types.
//
// Two layers live here:
//   - `resp`: the line-delimited frame grammar spoken on the raw TCP
//     connection to the pub/sub broker.
//   - `envelope`: the JSON payloads published on service channels.

pub mod envelope;
pub mod resp;

pub use envelope::{
    listener_channel, listener_id, Body, Envelope, RequestBody, ResponseBody, ResponseType,
    WorkerCounters, HEALTHCHECK_CHANNEL,
};
pub use resp::{Frame, WireCodec, WireError};
