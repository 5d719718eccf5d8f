//! Batch queries over a pooled connection and the cache tier.
//!
//! A player list is one primary request carrying every game id, optionally
//! enriched with per-player secondary data (group, stats). Secondary data
//! is served from the cache where possible; misses are looked up
//! concurrently under a limit and an overall deadline, and successful
//! answers are written back before they are merged.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{CacheTier, TtlCache};
use crate::error::{BlazeError, Result};
use crate::pool::ConnectionPool;
use crate::protocol::{body, methods, Body, Packet};
use crate::provider::StatsProvider;

/// Deadline for the primary player-list request.
pub const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for one batch of secondary lookups.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Secondary lookups allowed in flight at once.
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 16;

/// Game list selector for full rosters.
pub const FULL_GAME_LIST: &str = "csFullGameList";

/// Configuration for [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub primary_timeout: Duration,
    pub lookup_timeout: Duration,
    pub lookup_concurrency: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            primary_timeout: DEFAULT_PRIMARY_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
        }
    }
}

impl QueryConfig {
    pub fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn with_lookup_concurrency(mut self, limit: usize) -> Self {
        self.lookup_concurrency = limit.max(1);
        self
    }
}

/// Why a query produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryFailure {
    #[error("Blaze client could not be initialized")]
    ClientUnavailable,

    #[error("Blaze backend timed out")]
    BackendTimeout,

    #[error("Blaze backend error: {0}")]
    Backend(String),

    #[error("Invalid Blaze response: {0}")]
    InvalidResponse(String),
}

/// What to add to a player list.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayerListOptions {
    /// Return the decoded reply body untouched.
    pub raw: bool,
    /// Attach each player's group.
    pub groups: bool,
    /// Attach each player's detailed stats.
    pub stats: bool,
}

impl PlayerListOptions {
    pub fn raw() -> Self {
        Self {
            raw: true,
            ..Self::default()
        }
    }

    pub fn with_groups(mut self) -> Self {
        self.groups = true;
        self
    }

    pub fn with_stats(mut self) -> Self {
        self.stats = true;
        self
    }
}

/// One player in a roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    #[serde(rename(deserialize = "PID"))]
    pub persona_id: u64,
    #[serde(rename(deserialize = "NAME"), default)]
    pub name: String,
    #[serde(rename(deserialize = "TIDX"), default)]
    pub team: u32,
    #[serde(rename(deserialize = "ROLE"), default)]
    pub role: String,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub group: Option<Value>,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
}

/// Players of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRoster {
    #[serde(skip_deserializing)]
    pub game_id: u64,
    #[serde(rename(deserialize = "GNAM"), default)]
    pub name: String,
    #[serde(rename(deserialize = "PROS"), default)]
    pub players: Vec<PlayerEntry>,
    /// Distinct groups of the players, in roster order.
    #[serde(skip_deserializing)]
    pub groups: Vec<Value>,
}

impl GameRoster {
    fn persona_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.players.iter().map(|p| p.persona_id)
    }
}

/// Result of [`Orchestrator::player_list`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerList {
    /// Decoded reply body, as requested by [`PlayerListOptions::raw`].
    Raw(Body),
    /// Rosters of the requested games that the server knows, in request order.
    Games(Vec<GameRoster>),
}

/// Which secondary lookup to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// Detailed stats, cached in the player tier.
    Stats,
    /// Active group, cached in the group tier.
    Group,
}

/// Runs player-list queries.
pub struct Orchestrator {
    account: u64,
    pool: Arc<ConnectionPool>,
    caches: Arc<CacheTier>,
    stats: Arc<dyn StatsProvider>,
    config: QueryConfig,
}

impl Orchestrator {
    /// Orchestrator querying on behalf of `account`.
    pub fn new(
        account: u64,
        pool: Arc<ConnectionPool>,
        caches: Arc<CacheTier>,
        stats: Arc<dyn StatsProvider>,
    ) -> Self {
        Self {
            account,
            pool,
            caches,
            stats,
            config: QueryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn caches(&self) -> &CacheTier {
        &self.caches
    }

    /// Rosters for `game_ids` in one request.
    ///
    /// # Errors
    ///
    /// - `ClientUnavailable` if no authenticated connection can be had
    /// - `BackendTimeout` if the server does not answer in time; the
    ///   connection is closed
    /// - `Backend` / `InvalidResponse` for error replies and replies that do
    ///   not parse; the connection must log in again before its next use
    pub async fn player_list(
        &self,
        game_ids: &[u64],
        options: PlayerListOptions,
    ) -> std::result::Result<PlayerList, QueryFailure> {
        let Some(conn) = self.pool.get_or_create(self.account).await else {
            return Err(QueryFailure::ClientUnavailable);
        };

        let request = Packet::command(
            methods::GET_GAME_DATA,
            body([("DNAM", json!(FULL_GAME_LIST)), ("GLST", json!(game_ids))]),
        );
        let reply = match conn
            .send_with_timeout(request, self.config.primary_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(BlazeError::Timeout { .. }) => {
                tracing::error!("Blaze backend timed out");
                conn.close().await;
                return Err(QueryFailure::BackendTimeout);
            }
            Err(e) => return Err(QueryFailure::Backend(e.to_string())),
        };

        if options.raw {
            return Ok(PlayerList::Raw(reply.body));
        }

        if reply.error_code != 0 {
            conn.mark_unauthenticated();
            return Err(QueryFailure::Backend(format!(
                "{} failed with error code {:#06x}",
                reply.method, reply.error_code
            )));
        }

        let mut games = match parse_rosters(&reply.body, game_ids) {
            Ok(games) => games,
            Err(e) => {
                tracing::warn!("Unparseable player list: {}", e);
                conn.mark_unauthenticated();
                return Err(QueryFailure::InvalidResponse(e.to_string()));
            }
        };

        if options.groups {
            self.attach_groups(&mut games).await;
        }
        if options.stats {
            self.attach_stats(&mut games).await;
        }
        Ok(PlayerList::Games(games))
    }

    async fn attach_groups(&self, games: &mut [GameRoster]) {
        let personas: Vec<u64> = games.iter().flat_map(GameRoster::persona_ids).collect();
        let found = self.fetch_groups(&personas).await;

        for game in games.iter_mut() {
            let mut groups: Vec<Value> = Vec::new();
            for player in game.players.iter_mut() {
                player.group = found
                    .get(&player.persona_id)
                    .filter(|group| !is_empty_group(group))
                    .cloned();
                if let Some(group) = &player.group {
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }
            }
            game.groups = groups;
        }
    }

    async fn attach_stats(&self, games: &mut [GameRoster]) {
        let personas: Vec<u64> = games.iter().flat_map(GameRoster::persona_ids).collect();
        let found = self.fetch_player_stats(&personas).await;

        for player in games.iter_mut().flat_map(|g| g.players.iter_mut()) {
            player.stats = found.get(&player.persona_id).cloned();
        }
    }

    /// Detailed stats for each persona, from the player cache or the provider.
    pub async fn fetch_player_stats(&self, personas: &[u64]) -> HashMap<u64, Value> {
        self.fetch(LookupKind::Stats, personas).await
    }

    /// Active group for each persona, from the group cache or the provider.
    pub async fn fetch_groups(&self, personas: &[u64]) -> HashMap<u64, Value> {
        self.fetch(LookupKind::Group, personas).await
    }

    /// Cached values for `keys`, looking up the misses.
    ///
    /// Keys whose lookup fails or misses the deadline are absent from the
    /// result; the rest of the batch is unaffected.
    pub async fn fetch(&self, kind: LookupKind, keys: &[u64]) -> HashMap<u64, Value> {
        let cache = self.cache_for(kind);
        let unique: BTreeSet<u64> = keys.iter().copied().collect();

        let mut found = cache.batch_get(&unique);
        let misses: Vec<u64> = unique
            .into_iter()
            .filter(|key| !found.contains_key(key))
            .collect();

        tracing::debug!(
            ?kind,
            hits = found.len(),
            misses = misses.len(),
            "Secondary lookup cache check"
        );
        if misses.is_empty() {
            return found;
        }

        let fetched = self.lookup_all(kind, &misses).await;
        cache.batch_put(fetched.iter().map(|(k, v)| (*k, v.clone())));
        found.extend(fetched);
        found
    }

    fn cache_for(&self, kind: LookupKind) -> &TtlCache<u64, Value> {
        match kind {
            LookupKind::Stats => &self.caches.players,
            LookupKind::Group => &self.caches.groups,
        }
    }

    async fn lookup_all(&self, kind: LookupKind, keys: &[u64]) -> HashMap<u64, Value> {
        let limit = Arc::new(Semaphore::new(self.config.lookup_concurrency));
        let mut tasks = JoinSet::new();

        for &key in keys {
            let provider = self.stats.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                (key, lookup_one(provider.as_ref(), kind, key).await)
            });
        }

        let mut fetched = HashMap::with_capacity(keys.len());
        let gather = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((key, Ok(Some(value)))) => {
                        fetched.insert(key, value);
                    }
                    Ok((_, Ok(None))) => {}
                    Ok((key, Err(e))) => {
                        tracing::warn!(?kind, persona_id = key, "Lookup failed: {}", e);
                    }
                    Err(e) => tracing::warn!(?kind, "Lookup task failed: {}", e),
                }
            }
        };

        if tokio::time::timeout(self.config.lookup_timeout, gather)
            .await
            .is_err()
        {
            tracing::warn!(
                ?kind,
                completed = fetched.len(),
                requested = keys.len(),
                "Lookup batch timed out"
            );
            tasks.abort_all();
        }
        fetched
    }
}

async fn lookup_one(provider: &dyn StatsProvider, kind: LookupKind, key: u64) -> Result<Option<Value>> {
    match kind {
        LookupKind::Stats => provider.detailed_stats(key).await,
        LookupKind::Group => provider.active_group(key).await.map(Some),
    }
}

fn is_empty_group(group: &Value) -> bool {
    match group {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// Typed rosters for `game_ids` from a reply body keyed by game id.
fn parse_rosters(reply: &Body, game_ids: &[u64]) -> Result<Vec<GameRoster>> {
    let mut games = Vec::with_capacity(game_ids.len());
    for &game_id in game_ids {
        let Some(game) = reply.get(&game_id.to_string()) else {
            continue;
        };
        let mut roster: GameRoster = serde_json::from_value(game.clone())?;
        roster.game_id = game_id;
        games.push(roster);
    }
    Ok(games)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::connection::{ConnectionConfig, ConnectionState};
    use crate::pool::PoolConfig;
    use crate::protocol::PacketKind;
    use crate::provider::{AccountProvider, BoxFuture};
    use crate::testing::{blaze_responder, login_reply_body, FakeConnector, Responder};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Accounts;

    impl AccountProvider for Accounts {
        fn auth_code(&self, _account: u64) -> BoxFuture<'_, Result<String>> {
            Box::pin(async { Ok("code".to_string()) })
        }
    }

    #[derive(Default)]
    struct Stats {
        calls: AtomicUsize,
        failing: HashSet<u64>,
        stalled: HashSet<u64>,
    }

    impl StatsProvider for Stats {
        fn detailed_stats(&self, persona_id: u64) -> BoxFuture<'_, Result<Option<Value>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.stalled.contains(&persona_id) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                if self.failing.contains(&persona_id) {
                    return Err(BlazeError::Connection("stats API down".into()));
                }
                Ok(Some(json!({ "kills": persona_id })))
            })
        }

        fn active_group(&self, persona_id: u64) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if persona_id % 2 == 0 {
                    Ok(json!({ "name": "even platoon" }))
                } else {
                    Ok(Value::Null)
                }
            })
        }
    }

    fn orchestrator(responder: Responder, stats: Arc<Stats>) -> (Orchestrator, Arc<FakeConnector>) {
        let connector = FakeConnector::new(responder);
        let pool = ConnectionPool::with_connector(
            PoolConfig::default()
                .with_connection(ConnectionConfig::new("blaze.test", 10539).without_keepalive()),
            Arc::new(Accounts),
            connector.clone(),
        );
        let caches = CacheTier::new(CacheConfig::players(), CacheConfig::groups());
        let orchestrator = Orchestrator::new(1, Arc::new(pool), Arc::new(caches), stats);
        (orchestrator, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_hits_look_up_only_misses() {
        let stats = Arc::new(Stats::default());
        let (orchestrator, _) = orchestrator(blaze_responder(), stats.clone());

        let keys: Vec<u64> = (1..=10).collect();
        orchestrator
            .caches()
            .players
            .batch_put(keys[..6].iter().map(|k| (*k, json!({ "cached": k }))));

        let found = orchestrator.fetch_player_stats(&keys).await;

        assert_eq!(stats.calls.load(Ordering::SeqCst), 4);
        assert_eq!(found.len(), 10);
        assert_eq!(found[&1], json!({ "cached": 1 }));
        assert_eq!(found[&10], json!({ "kills": 10 }));
        assert_eq!(orchestrator.caches().players.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_hits_with_one_failing_lookup() {
        let stats = Arc::new(Stats {
            failing: HashSet::from([8]),
            ..Stats::default()
        });
        let (orchestrator, _) = orchestrator(blaze_responder(), stats.clone());

        let keys: Vec<u64> = (1..=10).collect();
        orchestrator
            .caches()
            .players
            .batch_put(keys[..6].iter().map(|k| (*k, json!({ "cached": k }))));

        let found = orchestrator.fetch_player_stats(&keys).await;

        assert_eq!(stats.calls.load(Ordering::SeqCst), 4);
        assert_eq!(found.len(), 9);
        assert!(!found.contains_key(&8));
        for key in [7, 9, 10] {
            assert_eq!(found[&key], json!({ "kills": key }));
        }
        assert_eq!(orchestrator.caches().players.len(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_is_absent_and_uncached() {
        let stats = Arc::new(Stats {
            failing: HashSet::from([3]),
            ..Stats::default()
        });
        let (orchestrator, _) = orchestrator(blaze_responder(), stats.clone());

        let found = orchestrator.fetch_player_stats(&[1, 2, 3, 4, 5]).await;

        assert_eq!(found.len(), 4);
        assert!(!found.contains_key(&3));
        assert_eq!(orchestrator.caches().players.len(), 4);

        // The failed key is retried next time, the rest are cache hits.
        orchestrator.fetch_player_stats(&[1, 2, 3, 4, 5]).await;
        assert_eq!(stats.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lookup_misses_deadline() {
        let stats = Arc::new(Stats {
            stalled: HashSet::from([9]),
            ..Stats::default()
        });
        let (orchestrator, _) = orchestrator(blaze_responder(), stats);

        let found = orchestrator.fetch_player_stats(&[7, 8, 9]).await;

        assert_eq!(found.len(), 2);
        assert!(!found.contains_key(&9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keys_looked_up_once() {
        let stats = Arc::new(Stats::default());
        let (orchestrator, _) = orchestrator(blaze_responder(), stats.clone());

        let found = orchestrator.fetch_groups(&[4, 4, 4]).await;
        assert_eq!(found.len(), 1);
        assert_eq!(stats.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_list_with_groups_and_stats() {
        let stats = Arc::new(Stats::default());
        let (orchestrator, connector) = orchestrator(blaze_responder(), stats);

        let list = orchestrator
            .player_list(&[1, 2, 99], PlayerListOptions::default().with_groups().with_stats())
            .await
            .unwrap();
        let PlayerList::Games(games) = list else {
            panic!("expected rosters");
        };

        assert_eq!(games.iter().map(|g| g.game_id).collect::<Vec<_>>(), vec![1, 2, 99]);
        let first = &games[0];
        assert_eq!(first.name, "game-1");
        assert_eq!(first.players.len(), 2);
        assert_eq!(first.players[0].persona_id, 100);
        assert_eq!(first.players[0].group, Some(json!({ "name": "even platoon" })));
        assert_eq!(first.players[1].group, None);
        assert_eq!(first.groups, vec![json!({ "name": "even platoon" })]);
        assert_eq!(first.players[1].stats, Some(json!({ "kills": 101 })));

        // Odd personas have no group, but that answer is cached too.
        assert_eq!(orchestrator.caches().groups.len(), 6);
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_player_list_returns_body() {
        let (orchestrator, _) = orchestrator(blaze_responder(), Arc::new(Stats::default()));

        let list = orchestrator
            .player_list(&[5], PlayerListOptions::raw())
            .await
            .unwrap();
        let PlayerList::Raw(body) = list else {
            panic!("expected raw body");
        };
        assert!(body.contains_key("5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_closes_connection() {
        let responder: Responder = Arc::new(|request: &Packet| {
            (request.method == methods::LOGIN)
                .then(|| Packet::reply_to(request, PacketKind::Result, login_reply_body(1)))
        });
        let (orchestrator, _) = orchestrator(responder, Arc::new(Stats::default()));

        let err = orchestrator
            .player_list(&[1], PlayerListOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, QueryFailure::BackendTimeout);
        assert_eq!(err.to_string(), "Blaze backend timed out");

        let status = orchestrator.pool.status().await;
        assert_eq!(status[0].connection.state, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_reply_forces_relogin() {
        let responder: Responder = Arc::new(|request: &Packet| {
            let fields = if request.method == methods::LOGIN {
                login_reply_body(1)
            } else {
                body([("1", json!("not a game"))])
            };
            Some(Packet::reply_to(request, PacketKind::Result, fields))
        });
        let (orchestrator, connector) = orchestrator(responder, Arc::new(Stats::default()));

        let err = orchestrator
            .player_list(&[1], PlayerListOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryFailure::InvalidResponse(_)));

        // Next call logs in on a fresh connection.
        let _ = orchestrator.player_list(&[1], PlayerListOptions::default()).await;
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_is_client_unavailable() {
        let (orchestrator, connector) = orchestrator(blaze_responder(), Arc::new(Stats::default()));
        connector.set_refuse(true);

        let err = orchestrator
            .player_list(&[1], PlayerListOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, QueryFailure::ClientUnavailable);
    }
}
