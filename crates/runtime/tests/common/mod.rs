#![allow(dead_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use quern_runtime::sandbox::native::NativeBackend;
use quern_runtime::sandbox::{CallResult, FunctionFlags, GuestArg, LoadContext};
use quern_runtime::{Error, Runtime, Value};
use tokio::sync::oneshot;

type Waiters = Arc<Mutex<VecDeque<oneshot::Sender<()>>>>;
type Gate = Arc<Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<Result<Value, String>>)>>>;

fn string_arg(args: &[Value], index: usize) -> Result<String, Error> {
    args.get(index)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::function("expected a string argument"))
}

fn value(v: Value) -> Result<CallResult, Error> {
    Ok(CallResult::Value(v))
}

fn counter_fn(counter: &Arc<AtomicI64>) -> GuestArg {
    let counter = Arc::clone(counter);
    GuestArg::callable(move |_client, _args| {
        value(Value::Int(counter.load(Ordering::SeqCst)))
    })
}

/// A `trigger`/`continue` pair: `trigger` parks a background task until the
/// continue function releases it, exercising policy checks that fire at
/// `block` after the world changed underneath the task.
fn register_suspend_pair(
    load: &mut LoadContext,
    background: impl Fn(&mut quern_runtime::client::CallClient<'_>, &[Value], Gate) -> Result<CallResult, Error>
    + Send
    + Sync
    + 'static,
    continues: &[(&'static str, FunctionFlags)],
    trigger_name: &'static str,
    continue_missing: &'static str,
) -> Result<(), Error> {
    let gate: Gate = Arc::new(Mutex::new(None));
    {
        let gate = Arc::clone(&gate);
        load.register_function(
            GuestArg::str(trigger_name),
            GuestArg::callable(move |client, args| background(client, args, Arc::clone(&gate))),
            FunctionFlags::default(),
        )?;
    }
    for (name, flags) in continues {
        let gate = Arc::clone(&gate);
        load.register_function(
            GuestArg::str(*name),
            GuestArg::callable(move |_client, _args| {
                let Some((go, done)) = gate.lock().take() else {
                    return Err(Error::function(continue_missing));
                };
                let _ = go.send(());
                Ok(CallResult::Async(Box::pin(async move {
                    match done.await {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(message)) => Err(Error::function(message)),
                        Err(_) => Err(Error::function("background task dropped")),
                    }
                })))
            }),
            *flags,
        )?;
    }
    Ok(())
}

/// Backend with every fixture module the integration tests load.
pub fn backend() -> NativeBackend {
    let backend = NativeBackend::new();

    backend.module("counter_v1", |load| {
        load.register_function(
            GuestArg::str("test"),
            GuestArg::callable(|_client, _args| value(Value::Int(1))),
            FunctionFlags::default(),
        )
    });
    backend.module("counter_v2", |load| {
        load.register_function(
            GuestArg::str("test"),
            GuestArg::callable(|_client, _args| value(Value::Int(2))),
            FunctionFlags::default(),
        )
    });
    backend.module("counter_bad", |load| {
        load.register_function(
            GuestArg::str("test"),
            GuestArg::callable(|_client, _args| value(Value::Int(2))),
            FunctionFlags::default(),
        )?;
        load.register_function(
            GuestArg::str("test2"),
            GuestArg::str("bar"),
            FunctionFlags::default(),
        )
    });
    backend.module("dup", |load| {
        for _ in 0..2 {
            load.register_function(
                GuestArg::str("test"),
                GuestArg::callable(|_client, _args| value(Value::Int(2))),
                FunctionFlags::default(),
            )?;
        }
        Ok(())
    });
    backend.module("bad_name", |load| {
        load.register_function(
            GuestArg::int(1),
            GuestArg::callable(|_client, _args| value(Value::Int(2))),
            FunctionFlags::default(),
        )
    });
    backend.module("empty", |_load| Ok(()));

    backend.module("pingpong", |load| {
        load.register_function(
            GuestArg::str("test"),
            GuestArg::callable(|client, _args| value(client.call("ping", &[])?)),
            FunctionFlags::default(),
        )
    });

    backend.module("getter", |load| {
        load.register_function(
            GuestArg::str("get"),
            GuestArg::callable(|client, args| {
                let key = string_arg(args, 0)?;
                value(client.call("get", &[&key])?)
            }),
            FunctionFlags::default(),
        )
    });
    backend.module("async_getter", |load| {
        load.register_function(
            GuestArg::str("get"),
            GuestArg::callable(|client, args| {
                let key = string_arg(args, 0)?;
                let bg = client.background();
                Ok(CallResult::Async(Box::pin(async move {
                    bg.block(|client| client.call("get", &[&key])).await
                })))
            }),
            FunctionFlags::default(),
        )
    });
    backend.module("nested_getter", |load| {
        load.register_function(
            GuestArg::str("get"),
            GuestArg::callable(|client, args| {
                let key = string_arg(args, 0)?;
                let bg = client.background();
                Ok(CallResult::Async(Box::pin(async move {
                    let (tx, rx) = oneshot::channel();
                    bg.block(move |client| {
                        client.run_on_background(move |inner| async move {
                            let reply = inner.block(|client| client.call("get", &[&key])).await;
                            let _ = tx.send(reply);
                            Ok(Value::Null)
                        });
                        Ok(Value::Null)
                    })
                    .await?;
                    rx.await
                        .map_err(|_| Error::function("background task dropped"))?
                })))
            }),
            FunctionFlags::default(),
        )
    });

    backend.module("setter", |load| {
        load.register_function(
            GuestArg::str("set"),
            GuestArg::callable(|client, args| {
                let key = string_arg(args, 0)?;
                let val = string_arg(args, 1)?;
                value(client.call("set", &[&key, &val])?)
            }),
            FunctionFlags::default(),
        )
    });
    backend.module("setter_nw", |load| {
        load.register_function(
            GuestArg::str("my_set"),
            GuestArg::callable(|client, args| {
                let key = string_arg(args, 0)?;
                let val = string_arg(args, 1)?;
                value(client.call("set", &[&key, &val])?)
            }),
            FunctionFlags::parse(["no-writes"])?,
        )
    });

    backend.module("ro", |load| {
        load.register_function(
            GuestArg::str("test1"),
            GuestArg::callable(|_client, _args| value(Value::Int(1))),
            FunctionFlags::default(),
        )?;
        load.register_function(
            GuestArg::str("test2"),
            GuestArg::callable(|_client, _args| value(Value::Int(1))),
            FunctionFlags::parse(["no-writes"])?,
        )
    });

    backend.module("raw", |load| {
        let probe = |name: &'static str, flags: FunctionFlags, load: &mut LoadContext| {
            load.register_function(
                GuestArg::str(name),
                GuestArg::callable(|_client, args| {
                    let kind = match args.first() {
                        Some(Value::Bytes(_)) => "bytes",
                        Some(Value::Str(_)) => "string",
                        _ => "none",
                    };
                    value(Value::str(kind))
                }),
                flags,
            )
        };
        probe("probe_raw", FunctionFlags::parse(["raw-arguments"])?, load)?;
        probe("probe", FunctionFlags::default(), load)
    });

    backend.module("suspend", |load| {
        register_suspend_pair(
            load,
            |client, args, gate| {
                let key = string_arg(args, 0)?;
                let val = string_arg(args, 1)?;
                let (go_tx, go_rx) = oneshot::channel();
                let (done_tx, done_rx) = oneshot::channel();
                *gate.lock() = Some((go_tx, done_rx));
                client.run_on_background(move |bg| async move {
                    go_rx
                        .await
                        .map_err(|_| Error::function("trigger abandoned"))?;
                    let outcome = bg
                        .block(|client| client.call("set", &[&key, &val]))
                        .await;
                    let _ = done_tx.send(outcome.map_err(|e| e.to_string()));
                    Ok(Value::Null)
                });
                value(Value::ok())
            },
            &[
                ("continue_oom", FunctionFlags::parse(["allow-oom"])?),
                ("continue_ro", FunctionFlags::parse(["no-writes"])?),
            ],
            "trigger",
            "no pending write was triggered",
        )
    });

    backend.module("acl_suspend", |load| {
        register_suspend_pair(
            load,
            |client, args, gate| {
                let key = string_arg(args, 0)?;
                let (go_tx, go_rx) = oneshot::channel();
                let (done_tx, done_rx) = oneshot::channel();
                *gate.lock() = Some((go_tx, done_rx));
                client.run_on_background(move |bg| async move {
                    go_rx
                        .await
                        .map_err(|_| Error::function("trigger abandoned"))?;
                    let outcome = bg.block(|client| client.call("get", &[&key])).await;
                    let _ = done_tx.send(outcome.map_err(|e| e.to_string()));
                    Ok(Value::Null)
                });
                value(Value::ok())
            },
            &[("continue", FunctionFlags::default())],
            "start",
            "no pending read was triggered",
        )
    });

    backend.module("notify", |load| {
        let count = Arc::new(AtomicI64::new(0));
        {
            let count = Arc::clone(&count);
            load.register_notification_consumer(
                GuestArg::str("consumer"),
                "",
                GuestArg::callable(move |_client, _args| {
                    count.fetch_add(1, Ordering::SeqCst);
                    value(Value::Null)
                }),
            )?;
        }
        load.register_function(GuestArg::str("count"), counter_fn(&count), FunctionFlags::default())
    });
    backend.module("notify_async", |load| {
        let count = Arc::new(AtomicI64::new(0));
        {
            let count = Arc::clone(&count);
            load.register_notification_consumer(
                GuestArg::str("consumer"),
                "",
                GuestArg::callable(move |_client, _args| {
                    let count = Arc::clone(&count);
                    Ok(CallResult::Async(Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    })))
                }),
            )?;
        }
        load.register_function(GuestArg::str("count"), counter_fn(&count), FunctionFlags::default())
    });
    backend.module("notify_block", |load| {
        load.register_notification_consumer(
            GuestArg::str("consumer"),
            "key",
            GuestArg::callable(|client, _args| {
                let bg = client.background();
                Ok(CallResult::Async(Box::pin(async move {
                    bg.block(|client| client.call("incr", &["count"])).await
                })))
            }),
        )
    });
    backend.module("notify_err", |load| {
        load.register_notification_consumer(
            GuestArg::str("consumer"),
            "",
            GuestArg::callable(|_client, _args| Err(Error::function("handler exploded"))),
        )
    });

    backend.module("stream_basic", |load| {
        let count = Arc::new(AtomicI64::new(0));
        {
            let count = Arc::clone(&count);
            load.register_stream_consumer(
                GuestArg::str("consumer"),
                "stream",
                1,
                false,
                GuestArg::callable(move |_client, _args| {
                    count.fetch_add(1, Ordering::SeqCst);
                    value(Value::Null)
                }),
            )?;
        }
        load.register_function(GuestArg::str("count"), counter_fn(&count), FunctionFlags::default())
    });
    backend.module("stream_trim", |load| {
        let count = Arc::new(AtomicI64::new(0));
        {
            let count = Arc::clone(&count);
            load.register_stream_consumer(
                GuestArg::str("consumer"),
                "stream",
                1,
                true,
                GuestArg::callable(move |_client, _args| {
                    count.fetch_add(1, Ordering::SeqCst);
                    value(Value::Null)
                }),
            )?;
        }
        load.register_function(GuestArg::str("count"), counter_fn(&count), FunctionFlags::default())
    });
    backend.module("stream_async", |load| {
        let count = Arc::new(AtomicI64::new(0));
        {
            let count = Arc::clone(&count);
            load.register_stream_consumer(
                GuestArg::str("consumer"),
                "stream",
                1,
                false,
                GuestArg::callable(move |_client, _args| {
                    let count = Arc::clone(&count);
                    Ok(CallResult::Async(Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    })))
                }),
            )?;
        }
        load.register_function(GuestArg::str("count"), counter_fn(&count), FunctionFlags::default())
    });
    backend.module("stream_err", |load| {
        load.register_stream_consumer(
            GuestArg::str("consumer"),
            "stream",
            1,
            false,
            GuestArg::callable(|_client, _args| Err(Error::function("Error"))),
        )
    });

    backend.module("stream_window", |load| {
        let waiters: Waiters = Arc::new(Mutex::new(VecDeque::new()));
        {
            let waiters = Arc::clone(&waiters);
            load.register_stream_consumer(
                GuestArg::str("consumer"),
                "stream",
                3,
                true,
                GuestArg::callable(move |_client, _args| {
                    let (tx, rx) = oneshot::channel();
                    waiters.lock().push_back(tx);
                    Ok(CallResult::Async(Box::pin(async move {
                        rx.await.map_err(|_| Error::function("resolver dropped"))?;
                        Ok(Value::Null)
                    })))
                }),
            )?;
        }
        {
            let waiters = Arc::clone(&waiters);
            load.register_function(
                GuestArg::str("num_pending"),
                GuestArg::callable(move |_client, _args| {
                    value(Value::Int(waiters.lock().len() as i64))
                }),
                FunctionFlags::default(),
            )?;
        }
        load.register_function(
            GuestArg::str("continue"),
            GuestArg::callable(move |_client, _args| {
                let Some(tx) = waiters.lock().pop_front() else {
                    return Err(Error::function("No pending records"));
                };
                let _ = tx.send(());
                value(Value::ok())
            }),
            FunctionFlags::default(),
        )
    });

    backend.module("stream_resume", |load| {
        let waiters: Arc<Mutex<VecDeque<(String, oneshot::Sender<()>)>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let delivered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let waiters = Arc::clone(&waiters);
            let delivered = Arc::clone(&delivered);
            load.register_stream_consumer(
                GuestArg::str("consumer"),
                "stream",
                1,
                false,
                GuestArg::callable(move |_client, args| {
                    let id = args
                        .first()
                        .and_then(|payload| payload.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let (tx, rx) = oneshot::channel();
                    waiters.lock().push_back((id.clone(), tx));
                    let delivered = Arc::clone(&delivered);
                    Ok(CallResult::Async(Box::pin(async move {
                        rx.await.map_err(|_| Error::function("resolver dropped"))?;
                        delivered.lock().push(id);
                        Ok(Value::Null)
                    })))
                }),
            )?;
        }
        {
            let waiters = Arc::clone(&waiters);
            load.register_function(
                GuestArg::str("num_pending"),
                GuestArg::callable(move |_client, _args| {
                    value(Value::Int(waiters.lock().len() as i64))
                }),
                FunctionFlags::default(),
            )?;
        }
        {
            let waiters = Arc::clone(&waiters);
            load.register_function(
                GuestArg::str("continue"),
                GuestArg::callable(move |_client, _args| {
                    let Some((_, tx)) = waiters.lock().pop_front() else {
                        return Err(Error::function("No pending records"));
                    };
                    let _ = tx.send(());
                    value(Value::ok())
                }),
                FunctionFlags::default(),
            )?;
        }
        load.register_function(
            GuestArg::str("delivered"),
            GuestArg::callable(move |_client, _args| {
                value(Value::Array(
                    delivered.lock().iter().map(|id| Value::str(id.clone())).collect(),
                ))
            }),
            FunctionFlags::default(),
        )
    });

    backend
}

pub fn runtime() -> Runtime {
    Runtime::builder().backend(Arc::new(backend())).build()
}

/// Shebang + module body for a fixture library.
pub fn source(name: &str, module: &str) -> String {
    format!("#!rs name={name}\n{module}")
}

/// Poll `f` until it returns `expected` or a few seconds elapse.
pub async fn wait_for<T, F>(mut f: F, expected: T) -> anyhow::Result<()>
where
    T: PartialEq + Debug,
    F: AsyncFnMut() -> anyhow::Result<T>,
{
    for _ in 0..300 {
        if f().await? == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let last = f().await?;
    anyhow::bail!("timed out waiting for {expected:?}, last value was {last:?}")
}

pub fn assert_err_contains<T: Debug>(result: Result<T, Error>, needle: &str) {
    match result {
        Ok(reply) => panic!("expected an error containing {needle:?}, got {reply:?}"),
        Err(error) => {
            let message = error.to_string();
            assert!(
                message.contains(needle),
                "error {message:?} does not contain {needle:?}"
            );
        }
    }
}

/// Find one library's entry in a `FUNCTION LIST` reply.
pub fn library_entry<'a>(list: &'a Value, name: &str) -> &'a Value {
    list.as_array()
        .expect("list reply is an array")
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
        .expect("library listed")
}

/// Non-panicking cursor lookup for polling replicated state.
pub fn find_stream_cursor<'a>(list: &'a Value, library: &str, stream: &str) -> Option<&'a Value> {
    list.as_array()?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(library))?
        .get("stream_consumers")
        .and_then(Value::as_array)
        .and_then(<[Value]>::first)?
        .get("streams")
        .and_then(Value::as_array)?
        .iter()
        .find(|cursor| cursor.get("name").and_then(Value::as_str) == Some(stream))
}

/// Find one stream's cursor map under the first stream consumer.
pub fn stream_cursor<'a>(entry: &'a Value, stream: &str) -> &'a Value {
    entry
        .get("stream_consumers")
        .and_then(Value::as_array)
        .and_then(<[Value]>::first)
        .and_then(|consumer| consumer.get("streams"))
        .and_then(Value::as_array)
        .expect("stream consumer listed")
        .iter()
        .find(|cursor| cursor.get("name").and_then(Value::as_str) == Some(stream))
        .expect("stream cursor listed")
}
