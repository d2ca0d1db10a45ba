//! Two peers in one process: establish a shared reference frame over the
//! in-memory session and watch a remote head pose converge.
//!
//! ```sh
//! cargo run -p cospace-engine --example two_peers
//! RUST_LOG=debug COSPACE_LOG_FORMAT=json cargo run -p cospace-engine --example two_peers
//! ```

use cospace_engine::SyncEngine;
use cospace_net::{BroadcastHub, MemorySession};
use cospace_types::{EntityId, PeerId, Pose};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::info;

fn main() {
    // Initialise tracing-subscriber from RUST_LOG (defaults to "info");
    // COSPACE_LOG_FORMAT=json switches to newline-delimited JSON.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("COSPACE_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    let session = MemorySession::new();
    let hmd = PeerId(1);
    let observer = PeerId(2);
    let head = EntityId(10);

    let mut a = SyncEngine::new(BroadcastHub::new(hmd));
    session.join(a.hub_mut());
    a.set_local_reference(Vector3::zeros(), UnitQuaternion::identity());

    // The observer joins late and still learns the HMD's frame from replay.
    let mut b = SyncEngine::new(BroadcastHub::new(observer));
    session.join(b.hub_mut());
    b.set_local_reference(Vector3::new(5.0, 0.0, 0.0), UnitQuaternion::identity());

    a.publish_local_pose(
        head,
        &Pose::new(Vector3::new(1.0, 1.6, 0.0), UnitQuaternion::identity()),
    );

    let dt = 1.0 / 60.0;
    for tick in 0..30 {
        a.tick(dt);
        b.tick(dt);
        if let Some(pose) = b.rendered_pose(hmd, head) {
            info!(tick, x = pose.position.x, y = pose.position.y, "observer sees HMD head");
        }
    }

    info!(
        aligned_a = a.is_aligned(),
        aligned_b = b.is_aligned(),
        "session state"
    );
}
