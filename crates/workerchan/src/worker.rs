//! Requests the worker answers itself.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use workerchan_channel::{
    HandlerError, HandlerResult, Notification, PayloadChannelListener, PayloadChannelSender,
    Request, Router,
};

use crate::logging::{ForwardLevel, ForwardLevelHandle};

/// Router for the `worker.*` methods on the control channel.
pub fn worker_router(level: ForwardLevelHandle) -> Router {
    let dump_level = level.clone();
    Router::new()
        .method("worker.close", |sender, _request| {
            info!("close requested by controller");
            sender.close();
            Ok(json!({}))
        })
        .method("worker.dump", move |sender, _request| {
            Ok(json!({
                "pid": std::process::id(),
                "logLevel": dump_level.get().as_str(),
                "channel": serde_json::to_value(sender.stats())?,
            }))
        })
        .method("worker.getResourceUsage", |_sender, _request| {
            let usage = ResourceUsage::current()
                .map_err(|err| HandlerError::failed(format!("getrusage failed: {err}")))?;
            Ok(serde_json::to_value(usage)?)
        })
        .method("worker.updateSettings", move |_sender, request| {
            update_settings(&level, request)
        })
        .on_close(|| debug!("controller closed the channel"))
}

fn update_settings(level: &ForwardLevelHandle, request: &Request) -> Result<Value, HandlerError> {
    if let Some(value) = request.data.get("logLevel") {
        let name = value
            .as_str()
            .ok_or_else(|| HandlerError::type_error("logLevel must be a string"))?;
        let parsed = ForwardLevel::parse(name)
            .ok_or_else(|| HandlerError::type_error(format!("invalid logLevel '{name}'")))?;
        level.set(parsed);
        info!(log_level = name, "forwarded log level updated");
    }
    Ok(json!({}))
}

/// Resource usage of the worker process, as reported by `getrusage(2)`.
///
/// CPU times are in milliseconds; the other fields are passed through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub ru_utime: u64,
    pub ru_stime: u64,
    pub ru_maxrss: u64,
    pub ru_ixrss: u64,
    pub ru_idrss: u64,
    pub ru_isrss: u64,
    pub ru_minflt: u64,
    pub ru_majflt: u64,
    pub ru_nswap: u64,
    pub ru_inblock: u64,
    pub ru_oublock: u64,
    pub ru_msgsnd: u64,
    pub ru_msgrcv: u64,
    pub ru_nsignals: u64,
    pub ru_nvcsw: u64,
    pub ru_nivcsw: u64,
}

impl ResourceUsage {
    pub fn current() -> std::io::Result<Self> {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        // SAFETY: `usage` is valid writable storage for one `rusage`.
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: getrusage(2) succeeded and filled the struct.
        let usage = unsafe { usage.assume_init() };
        Ok(Self::from_rusage(&usage))
    }

    fn from_rusage(usage: &libc::rusage) -> Self {
        Self {
            ru_utime: millis(&usage.ru_utime),
            ru_stime: millis(&usage.ru_stime),
            ru_maxrss: count(usage.ru_maxrss),
            ru_ixrss: count(usage.ru_ixrss),
            ru_idrss: count(usage.ru_idrss),
            ru_isrss: count(usage.ru_isrss),
            ru_minflt: count(usage.ru_minflt),
            ru_majflt: count(usage.ru_majflt),
            ru_nswap: count(usage.ru_nswap),
            ru_inblock: count(usage.ru_inblock),
            ru_oublock: count(usage.ru_oublock),
            ru_msgsnd: count(usage.ru_msgsnd),
            ru_msgrcv: count(usage.ru_msgrcv),
            ru_nsignals: count(usage.ru_nsignals),
            ru_nvcsw: count(usage.ru_nvcsw),
            ru_nivcsw: count(usage.ru_nivcsw),
        }
    }
}

fn count(value: libc::c_long) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn millis(time: &libc::timeval) -> u64 {
    let secs = u64::try_from(time.tv_sec).unwrap_or(0);
    let micros = u64::try_from(time.tv_usec).unwrap_or(0);
    secs.saturating_mul(1000).saturating_add(micros / 1000)
}

/// Listener for the payload channel. The worker has no payload methods of
/// its own.
#[derive(Debug, Default)]
pub struct PayloadHandler;

impl PayloadChannelListener for PayloadHandler {
    fn on_payload_request(
        &mut self,
        sender: &mut PayloadChannelSender,
        request: &Request,
        _payload: Option<&[u8]>,
    ) -> HandlerResult {
        warn!(id = request.id, method = %request.method, "unknown payload channel method");
        sender.send(&request.reject(format!("unknown method '{}'", request.method)))?;
        Ok(())
    }

    fn on_payload_notification(
        &mut self,
        _sender: &mut PayloadChannelSender,
        notification: &Notification,
        payload: Option<&[u8]>,
    ) -> HandlerResult {
        debug!(
            event = %notification.event,
            len = payload.map_or(0, <[u8]>::len),
            "payload notification"
        );
        Ok(())
    }

    fn on_payload_channel_closed(&mut self) {
        debug!("controller closed the payload channel");
    }
}
