//! Construction of the crash event captured by the in-process backend

use crate::{FaultContext, SignalDescriptor, Value};
use serde_json::{Map, json};

/// The maximum number of frames captured for a crash event
pub const MAX_FRAMES: usize = 128;

pub const UNKNOWN_SIGNAL_TYPE: &str = "UNKNOWN_SIGNAL";
pub const UNKNOWN_SIGNAL_VALUE: &str = "UnknownSignal";

/// Walks the stack of the current thread into `frames`, innermost frame
/// first.
///
/// When called from a fault handler the walk starts at the frame that
/// faulted, skipping the frames of the handler itself and the signal
/// trampoline. If the faulting frame can't be found, eg. for a synthetic
/// context, the entire stack of the current thread is captured instead.
pub fn unwind_current_stack(context: &FaultContext, frames: &mut [usize]) -> usize {
    if let Some(pc) = context.instruction_pointer() {
        let count = walk_stack(frames, Some(pc));
        if count > 0 {
            return count;
        }
    }

    walk_stack(frames, None)
}

fn walk_stack(frames: &mut [usize], start_at: Option<usize>) -> usize {
    let mut count = 0;
    let mut started = start_at.is_none();

    // SAFETY: the unsynchronized variant does not take the global backtrace
    // lock, which may be held by the thread that faulted
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;

            if !started {
                if Some(ip) != start_at {
                    return true;
                }
                started = true;
            }

            if count >= frames.len() {
                return false;
            }

            frames[count] = ip;
            count += 1;
            true
        });
    }

    count
}

/// Builds a fatal event for a fault.
///
/// `backtrace` is in capture order, ie innermost frame first, the event lists
/// the frames in reverse so that the outermost frame comes first and the
/// faulting frame last.
pub fn make_signal_event(descriptor: Option<&SignalDescriptor>, backtrace: &[usize]) -> Value {
    let (kind, value) = descriptor.map_or((UNKNOWN_SIGNAL_TYPE, UNKNOWN_SIGNAL_VALUE), |desc| {
        (desc.name, desc.description)
    });

    let signal_meta = match descriptor {
        Some(desc) => json!({
            "name": desc.name,
            "number": desc.code,
        }),
        None => Value::Object(Map::new()),
    };

    let frames: Vec<_> = backtrace
        .iter()
        .rev()
        .map(|addr| json!({ "instruction_addr": format!("{addr:#x}") }))
        .collect();

    json!({
        "event_id": uuid::Uuid::new_v4().simple().to_string(),
        "timestamp": timestamp(),
        "platform": "native",
        "level": "fatal",
        "exception": {
            "values": [{
                "type": kind,
                "value": value,
                "mechanism": {
                    "type": "signalhandler",
                    "synthetic": true,
                    "handled": false,
                    "meta": {
                        "signal": signal_meta,
                    },
                },
                "stacktrace": {
                    "frames": frames,
                },
            }],
        },
    })
}

fn timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0.0, |dur| dur.as_secs_f64())
}

#[cfg(test)]
mod test {
    use super::*;

    fn exception(event: &Value) -> &Value {
        &event["exception"]["values"][0]
    }

    #[test]
    fn known_signal() {
        let desc = &crate::DESCRIPTORS[0];
        let event = make_signal_event(Some(desc), &[0x10]);

        assert_eq!(event["level"], "fatal");
        let exc = exception(&event);
        assert_eq!(exc["type"], desc.name);
        assert_eq!(exc["value"], desc.description);

        let mechanism = &exc["mechanism"];
        assert_eq!(mechanism["type"], "signalhandler");
        assert_eq!(mechanism["synthetic"], true);
        assert_eq!(mechanism["handled"], false);
        assert_eq!(mechanism["meta"]["signal"]["name"], desc.name);
        assert_eq!(mechanism["meta"]["signal"]["number"], desc.code);
    }

    #[test]
    fn unknown_signal() {
        let event = make_signal_event(None, &[]);
        let exc = exception(&event);

        assert_eq!(exc["type"], UNKNOWN_SIGNAL_TYPE);
        assert_eq!(exc["value"], UNKNOWN_SIGNAL_VALUE);
        assert_eq!(exc["mechanism"]["meta"]["signal"], json!({}));
        assert_eq!(exc["stacktrace"]["frames"], json!([]));
    }

    #[test]
    fn frames_are_reversed() {
        let event = make_signal_event(None, &[0x1000, 0x2000, 0xdead_beef]);

        let addrs: Vec<_> = exception(&event)["stacktrace"]["frames"]
            .as_array()
            .unwrap()
            .iter()
            .map(|frame| frame["instruction_addr"].as_str().unwrap().to_owned())
            .collect();

        assert_eq!(addrs, ["0xdeadbeef", "0x2000", "0x1000"]);
    }

    #[test]
    fn unwinds_current_stack() {
        let mut frames = [0usize; MAX_FRAMES];
        crate::with_synthetic_context(0, |ctx| {
            let count = unwind_current_stack(ctx, &mut frames);
            assert!(count > 0);
            assert!(count <= MAX_FRAMES);
        });

        let mut two = [0usize; 2];
        crate::with_synthetic_context(0, |ctx| {
            assert_eq!(unwind_current_stack(ctx, &mut two), 2);
        });
    }
}
