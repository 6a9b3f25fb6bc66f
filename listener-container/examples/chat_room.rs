//! Chat Room - demonstrates the listener container against the in-memory broker
//!
//! This example shows:
//! - Channel and pattern listeners registered before start
//! - Listeners joining and leaving while the container runs
//! - Recovery after the broker drops every connection
//! - Clean shutdown on Ctrl+C
//!
//! Run with: cargo run -p pubsub-listener-container --example chat_room
//! Set LISTENER_LOG_MODE=debug for subscription traffic.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use listener_container::logging::{self, LoggingMode};
use listener_container::{
    listener_fn, ContainerConfig, ListenerContainer, MemoryBroker, MessageListener,
    RecoveryBackoff, ThreadExecutor, Topic,
};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    if std::env::var("LISTENER_LOG_MODE").is_ok() {
        logging::init_logging_from_env()?;
    } else {
        logging::init_logging(LoggingMode::Development)?;
    }

    println!("=== Chat Room (in-memory broker) ===\n");

    let broker = MemoryBroker::new();

    // Step 1: Listeners for one room and every room
    let general: Arc<dyn MessageListener> = listener_fn(|_, message| {
        println!(
            "  [general] {}",
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    });

    let total = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&total);
    let audit = listener_fn(move |topic, message| {
        let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
        println!("  [audit #{}] {} via {}", seen, message.channel, topic);
        Ok(())
    });

    // Step 2: Build and start the container
    let container = ListenerContainer::builder(Arc::new(broker.clone()))
        .config(
            ContainerConfig::new()
                .with_name("chat")
                .with_recovery(RecoveryBackoff::exponential(
                    Duration::from_millis(100),
                    Duration::from_secs(2),
                    2.0,
                )),
        )
        .task_executor(Arc::new(ThreadExecutor::new("chat-dispatch")))
        .listener(Arc::clone(&general), [Topic::channel("room.general")])
        .listener(audit, [Topic::pattern("room.*")])
        .build()?;

    container.start()?;
    println!("Container running: {}", container.is_running());

    // Step 3: Chatter
    broker.publish("room.general", "alice: hi all");
    broker.publish("room.random", "bob: anyone seen my keys?");
    thread::sleep(Duration::from_millis(200));

    // Step 4: A direct-message listener joins while running
    let dm = listener_fn(|_, message| {
        println!("  [dm] {}", String::from_utf8_lossy(&message.payload));
        Ok(())
    });
    container.add_message_listener(Arc::clone(&dm), Topic::channel("dm.alice"));
    broker.publish("dm.alice", "carol: lunch?");
    thread::sleep(Duration::from_millis(200));

    // Step 5: The broker drops everyone; the container resubscribes
    println!("\nBroker restarting...");
    broker.disconnect_all();
    thread::sleep(Duration::from_millis(500));
    println!(
        "Listening again: {} ({} connection(s))",
        container.is_listening(),
        broker.connection_count()
    );
    broker.publish("room.general", "alice: back online");
    thread::sleep(Duration::from_millis(200));

    // Step 6: general leaves
    container.remove_listener(&general);
    broker.publish("room.general", "bob: where did everyone go?");
    thread::sleep(Duration::from_millis(200));

    println!("\nWaiting for Ctrl+C (publishing a heartbeat every second)...");
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut beat = 0u64;
    while running.load(Ordering::SeqCst) {
        beat += 1;
        broker.publish("room.heartbeat", format!("tick {}", beat));
        thread::sleep(Duration::from_secs(1));
    }

    println!("\nShutting down...");
    container.stop();
    container.destroy()?;
    println!(
        "Stopped after {} audited message(s); open connections: {}",
        total.load(Ordering::SeqCst),
        broker.connection_count()
    );

    Ok(())
}
