//! feedsync session simulator
//!
//! Drives one local user and a handful of remote users through a scripted
//! session against the in-memory remote store, then prints the feed the
//! local client converged on.
//!
//! Usage:
//!   feedsync-sim --users 3 --latency-ms 40 --fail-every 4 --gap
//!
//! Remote users write straight to the remote store, so their changes reach
//! the local client only through the push feed (or a resync after `--gap`).

use anyhow::{Context, Result};
use clap::Parser;
use feedsync_model::{Collection, Entity, EntityKey, Like, Post, Profile};
use feedsync_storage::EntityStore;
use feedsync_sync::remote::memory::MemoryRemote;
use feedsync_sync::{
    FeedClient, Intent, MutationOutcome, PendingMutation, RemoteError, RemoteStore,
    SubscriptionFilter, SubscriptionHandle, SyncConfig, SyncNotice,
};
use feedsync_types::{EntityId, Timestamp, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

const NAMES: [&str; 6] = ["alice", "bob", "carol", "dave", "erin", "frank"];

#[derive(Parser, Debug)]
#[command(name = "feedsync-sim")]
#[command(about = "Scripted feed session against an in-memory remote store")]
struct Args {
    /// Number of users, the local one included
    #[arg(short, long, default_value = "3", value_parser = clap::value_parser!(u8).range(2..=6))]
    users: u8,

    /// Posts written by each user
    #[arg(short, long, default_value = "2")]
    posts: usize,

    /// Remote write latency in milliseconds
    #[arg(long, default_value = "25")]
    latency_ms: u64,

    /// Fail every Nth remote write with a network error (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: usize,

    /// Drop the push feed mid-session and resync afterwards
    #[arg(long)]
    gap: bool,

    /// Upper bound on a single remote write, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default)]
struct Tally {
    confirmed: usize,
    tombstoned: usize,
    rolled_back: usize,
}

struct Session {
    client: FeedClient,
    remote: Arc<MemoryRemote>,
    me: UserId,
    others: Vec<UserId>,
    fail_every: usize,
    writes: usize,
    pending: Vec<(&'static str, PendingMutation)>,
    tally: Tally,
}

impl Session {
    /// Queues a local intent, arming an injected failure when due.
    async fn submit(&mut self, label: &'static str, intent: Intent) -> Result<()> {
        self.writes += 1;
        if self.fail_every > 0 && self.writes % self.fail_every == 0 {
            debug!(label, "injecting network failure");
            self.remote
                .fail_next(RemoteError::Network("injected failure".into()));
        }
        let pending = self
            .client
            .submit(self.me, intent)
            .await
            .with_context(|| format!("{label} rejected"))?;
        self.pending.push((label, pending));
        Ok(())
    }

    /// Waits for every queued intent to settle.
    async fn settle(&mut self) -> Result<()> {
        for (label, pending) in std::mem::take(&mut self.pending) {
            match pending.outcome().await? {
                MutationOutcome::Confirmed { .. } => self.tally.confirmed += 1,
                MutationOutcome::Tombstoned { key } => {
                    info!(label, %key, "target vanished remotely");
                    self.tally.tombstoned += 1;
                }
                MutationOutcome::RolledBack { reason } => {
                    warn!(label, %reason, "mutation rolled back");
                    self.tally.rolled_back += 1;
                }
            }
        }
        Ok(())
    }

    /// A write by another user, straight to the remote.
    async fn remote_insert(&self, user: UserId, record: Entity) -> Option<Entity> {
        match self.remote.insert(user, record).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%user, error = %e, "remote user's write failed");
                None
            }
        }
    }

    async fn store(&self) -> EntityStore {
        self.client.store().await
    }

    /// Polls until the local feed holds at least `count` posts.
    async fn wait_for_feed(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while self.store().await.feed().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!(count, "feed did not reach the expected size");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Duration::from_millis(args.latency_ms));
    let config =
        SyncConfig::default().with_mutation_timeout(Duration::from_millis(args.timeout_ms));
    let client = FeedClient::new(remote.clone(), config);

    let users: Vec<UserId> = (0..args.users).map(|_| UserId::new()).collect();
    let (me, others) = users
        .split_first()
        .map(|(me, others)| (*me, others.to_vec()))
        .context("at least one user is required")?;
    for (user, name) in users.iter().zip(NAMES) {
        remote.seed(Profile::new(*user, name, Timestamp::ZERO));
    }
    info!(users = users.len(), posts = args.posts, gap = args.gap, "starting session");

    let mut session = Session {
        client,
        remote,
        me,
        others,
        fail_every: args.fail_every,
        writes: 0,
        pending: Vec::new(),
        tally: Tally::default(),
    };

    let handles = connect(&session.client).await?;
    run(&mut session, args.posts, args.gap).await?;

    tokio::time::sleep(Duration::from_millis(args.latency_ms * 4 + 50)).await;
    for handle in handles {
        handle.unsubscribe().await;
    }

    report(&session).await;
    Ok(())
}

/// Loads every collection and follows its push feed.
async fn connect(client: &FeedClient) -> Result<Vec<SubscriptionHandle>> {
    let mut handles = Vec::with_capacity(Collection::ALL.len());
    for collection in Collection::ALL {
        client
            .load(collection)
            .await
            .with_context(|| format!("failed to load {collection}"))?;
        handles.push(
            client
                .follow_collection(collection, SubscriptionFilter::All)
                .await
                .with_context(|| format!("failed to subscribe to {collection}"))?,
        );
    }
    Ok(handles)
}

async fn run(session: &mut Session, posts: usize, gap: bool) -> Result<()> {
    // Local profile and posts.
    session
        .submit(
            "update_profile",
            Intent::UpdateProfile {
                display_name: NAMES[0].into(),
                bio: "trying out feedsync".into(),
            },
        )
        .await?;
    for i in 0..posts {
        session
            .submit(
                "create_post",
                Intent::CreatePost {
                    body: format!("post {i} from {}", NAMES[0]),
                },
            )
            .await?;
    }

    // Everyone else posts.
    let mut written = 0;
    for (user, name) in session.others.clone().into_iter().zip(NAMES.into_iter().skip(1)) {
        for i in 0..posts {
            let draft = Post::new(
                EntityId::new(),
                user,
                format!("post {i} from {name}"),
                Timestamp::ZERO,
            );
            if session.remote_insert(user, draft.into()).await.is_some() {
                written += 1;
            }
        }
    }
    session.settle().await?;
    let expected = written + session.store().await.posts_by(session.me).len();
    session.wait_for_feed(expected).await;

    // React to the others.
    for user in session.others.clone() {
        session
            .submit("toggle_follow", Intent::ToggleFollow { followee_id: user })
            .await?;
    }
    let theirs: Vec<Post> = session
        .store()
        .await
        .feed()
        .into_iter()
        .filter(|post| post.author_id != session.me)
        .collect();
    for post in &theirs {
        session
            .submit("toggle_like", Intent::ToggleLike { post_id: post.id })
            .await?;
    }
    if let Some(first) = theirs.first() {
        session
            .submit(
                "add_comment",
                Intent::AddComment {
                    post_id: first.id,
                    body: "nice one".into(),
                },
            )
            .await?;
    }
    session.settle().await?;

    if gap {
        simulate_gap(session).await?;
    }
    Ok(())
}

/// Others like the local user's posts and delete one of theirs while the
/// feed is down; the resync has to recover both.
async fn simulate_gap(session: &mut Session) -> Result<()> {
    let mut notices = session.client.notices();
    let mine = session.store().await.posts_by(session.me);

    info!("feed interrupted");
    session.remote.interrupt_feed();
    for user in session.others.clone() {
        for post in &mine {
            session
                .remote_insert(user, Like::new(post.id, user, Timestamp::ZERO).into())
                .await;
        }
    }
    if let Some(victim) = session.others.first().copied() {
        let theirs = session.store().await.posts_by(victim);
        if let Some(post) = theirs.last() {
            if let Err(e) = session.remote.delete(victim, EntityKey::post(post.id)).await {
                warn!(error = %e, "remote delete failed");
            }
        }
    }

    info!("feed restored");
    session.remote.restore_feed();
    wait_for_resyncs(&mut notices, Collection::ALL.len()).await;
    Ok(())
}

async fn wait_for_resyncs(notices: &mut broadcast::Receiver<SyncNotice>, expected: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = 0;
        while seen < expected {
            match notices.recv().await {
                Ok(SyncNotice::ResyncCompleted { collection, report }) => {
                    info!(
                        %collection,
                        applied = report.applied,
                        tombstoned = report.tombstoned,
                        "resynced"
                    );
                    seen += 1;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!(expected, "not every collection resynced");
    }
}

async fn report(session: &Session) {
    let store = session.store().await;
    let name = |user: UserId| {
        store
            .profile(user)
            .map(|p| p.display_name)
            .unwrap_or_else(|| user.to_string())
    };

    let feed = store.feed();
    println!("feed ({} posts)", feed.len());
    for post in &feed {
        println!(
            "  {:<8} {:<24} likes={} comments={}",
            name(post.author_id),
            post.body,
            store.like_count(post.id),
            store.comment_count(post.id),
        );
    }

    let stats = store.profile_stats(session.me);
    println!();
    println!(
        "{}: {} posts, {} followers, {} following",
        name(session.me),
        stats.posts,
        stats.followers,
        stats.following
    );
    println!(
        "mutations: {} confirmed, {} tombstoned, {} rolled back",
        session.tally.confirmed, session.tally.tombstoned, session.tally.rolled_back
    );
}
