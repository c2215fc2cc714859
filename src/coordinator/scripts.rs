//! Server-side transactions of the Redis coordinator
//!
//! Each multi-step mutation runs as one Lua script so no other client can
//! observe a half-applied update. Scripts that touch rotation accounting are
//! prefixed with [`ROTATION`], which holds the two shared rules:
//!
//! - `reconcile`: store a destination's limit, strip it from both rotations if
//!   a changed limit is already exceeded, then top Main up to
//!   `min(limit - total, queued - in_main)` occurrences.
//! - `settle`: give one Pending occurrence back and re-add the destination to
//!   Main iff `total < limit` and `queued >= total + 1`. Returns whether it
//!   re-added and whether a Pending occurrence was found.
//!
//! Expiry scores are milliseconds since the epoch; `+inf` means never.

use redis::Script;

const ROTATION: &str = r#"
local function occurrences(list, host)
  return #redis.call('LPOS', list, host, 'COUNT', 0)
end

local function is_live(score, now)
  if not score then
    return false
  end
  if score == 'inf' or score == '+inf' then
    return true
  end
  return tonumber(score) > now
end

local function reconcile(main, pending, concurrency, hostq, host, limit)
  local previous = redis.call('HGET', concurrency, host)
  redis.call('HSET', concurrency, host, limit)
  local in_main = occurrences(main, host)
  local total = in_main + occurrences(pending, host)
  if previous and tonumber(previous) ~= limit and total > limit then
    redis.call('LREM', main, 0, host)
    redis.call('LREM', pending, 0, host)
    total = 0
    in_main = 0
  end
  local add = math.min(limit - total, redis.call('LLEN', hostq) - in_main)
  for _ = 1, add do
    redis.call('RPUSH', main, host)
  end
end

local function settle(main, pending, concurrency, hostq, host)
  local found = redis.call('LREM', pending, 1, host)
  local limit = tonumber(redis.call('HGET', concurrency, host) or '1')
  local total = occurrences(main, host) + occurrences(pending, host)
  if total < limit and redis.call('LLEN', hostq) >= total + 1 then
    redis.call('RPUSH', main, host)
    return 1, found
  end
  return 0, found
end
"#;

/// KEYS: dedup, keys, hostq, main, pending, concurrency, hosts
/// ARGV: key, correlation id, entry, host, limit, placement, dedup expiry,
///       max length (0 = unbounded), now
const ADMIT: &str = r#"
local now = tonumber(ARGV[9])
local expiry = redis.call('ZSCORE', KEYS[1], ARGV[1])
if is_live(expiry, now) then
  return {0, 0}
end

local max_len = tonumber(ARGV[8])
local len = redis.call('LLEN', KEYS[3])
if max_len > 0 and len >= max_len then
  return {-1, len}
end

redis.call('ZADD', KEYS[1], ARGV[7], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
if ARGV[6] == 'front' then
  redis.call('LPUSH', KEYS[3], ARGV[3])
else
  redis.call('RPUSH', KEYS[3], ARGV[3])
end
redis.call('SADD', KEYS[7], ARGV[4])
reconcile(KEYS[4], KEYS[5], KEYS[6], KEYS[3], ARGV[4], tonumber(ARGV[5]))
return {1, 0}
"#;

/// KEYS: hostq, main, pending, concurrency, hosts, tombstones, inflight
/// ARGV: host, ack token, now
const CHECKOUT: &str = r#"
local raw = redis.call('LPOP', KEYS[1])
if not raw then
  redis.call('LREM', KEYS[2], 0, ARGV[1])
  redis.call('LREM', KEYS[3], 0, ARGV[1])
  redis.call('SREM', KEYS[5], ARGV[1])
  return {0, false}
end
if redis.call('LLEN', KEYS[1]) == 0 then
  redis.call('SREM', KEYS[5], ARGV[1])
end

local entry = cjson.decode(raw)
local tomb = redis.call('ZSCORE', KEYS[6], entry.correlation_id)
if tomb then
  redis.call('ZREM', KEYS[6], entry.correlation_id)
  if is_live(tomb, tonumber(ARGV[3])) then
    settle(KEYS[2], KEYS[3], KEYS[4], KEYS[1], ARGV[1])
    return {2, raw}
  end
end

redis.call('HSET', KEYS[7], ARGV[2], raw)
return {1, raw}
"#;

/// KEYS: inflight, keys, dedup, tombstones, main, pending, concurrency, hostq
/// ARGV: ack token, host
const RELEASE: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return {0, 0, 0}
end

local entry = cjson.decode(raw)
if entry.destination ~= ARGV[2] then
  return {-1, 0, 0}
end

redis.call('HDEL', KEYS[1], ARGV[1])
if redis.call('HGET', KEYS[2], entry.key) == entry.correlation_id then
  redis.call('HDEL', KEYS[2], entry.key)
  redis.call('ZREM', KEYS[3], entry.key)
end
redis.call('ZREM', KEYS[4], entry.correlation_id)

local limit = redis.call('HGET', KEYS[7], ARGV[2])
local limit_changed = limit and tonumber(limit) ~= tonumber(entry.concurrency)
local requeued, found = settle(KEYS[5], KEYS[6], KEYS[7], KEYS[8], ARGV[2])
local missing = 0
if found == 0 and not limit_changed then
  missing = 1
end
return {1, requeued, missing}
"#;

/// KEYS: inflight, hostq, main, pending, concurrency, hosts
/// ARGV: ack token, host
const REQUEUE: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if not raw then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('LPUSH', KEYS[2], raw)
redis.call('SADD', KEYS[6], ARGV[2])
redis.call('LREM', KEYS[4], 1, ARGV[2])
local limit = redis.call('HGET', KEYS[5], ARGV[2]) or cjson.decode(raw).concurrency
reconcile(KEYS[3], KEYS[4], KEYS[5], KEYS[2], ARGV[2], tonumber(limit))
return 1
"#;

/// KEYS: main, pending
/// ARGV: host
const RETURN_SLOT: &str = r#"
if redis.call('LREM', KEYS[2], -1, ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[1], ARGV[1])
  return 1
end
return 0
"#;

/// KEYS: keys, dedup, tombstones
/// ARGV: key, tombstone expiry
const REMOVE: &str = r#"
local corr = redis.call('HGET', KEYS[1], ARGV[1])
if not corr then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], corr)
return 1
"#;

/// KEYS: hostq, keys, dedup, main, hosts
/// ARGV: host
const PURGE: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(entries) do
  local entry = cjson.decode(raw)
  if redis.call('HGET', KEYS[2], entry.key) == entry.correlation_id then
    redis.call('HDEL', KEYS[2], entry.key)
    redis.call('ZREM', KEYS[3], entry.key)
  end
end
redis.call('DEL', KEYS[1])
redis.call('LREM', KEYS[4], 0, ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
return #entries
"#;

/// KEYS: inflight, main, pending, concurrency, hosts, instances
/// ARGV: host queue prefix, instance
///
/// Host queue keys are derived from the recovered entries, so this script is
/// not safe on a sharded deployment.
const RECOVER: &str = r#"
local records = redis.call('HVALS', KEYS[1])
for _, raw in ipairs(records) do
  local entry = cjson.decode(raw)
  local hostq = ARGV[1] .. entry.destination
  redis.call('LPUSH', hostq, raw)
  redis.call('SADD', KEYS[5], entry.destination)
  redis.call('LREM', KEYS[3], 1, entry.destination)
  reconcile(KEYS[2], KEYS[3], KEYS[4], hostq, entry.destination, tonumber(entry.concurrency))
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[6], ARGV[2])
return records
"#;

/// KEYS: instances
/// ARGV: lease key prefix, own instance
const ORPHANED: &str = r#"
local dead = {}
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if id ~= ARGV[2] and redis.call('EXISTS', ARGV[1] .. id) == 0 then
    table.insert(dead, id)
  end
end
return dead
"#;

/// KEYS: set
/// ARGV: member, now
const SET_HAS: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return 0
end
if is_live(score, tonumber(ARGV[2])) then
  return 1
end
redis.call('ZREM', KEYS[1], ARGV[1])
return 0
"#;

/// Compiled scripts, loaded lazily by `EVALSHA` with `EVAL` fallback
pub struct Scripts {
    pub admit: Script,
    pub checkout: Script,
    pub release: Script,
    pub requeue: Script,
    pub return_slot: Script,
    pub remove: Script,
    pub purge: Script,
    pub recover: Script,
    pub orphaned: Script,
    pub set_has: Script,
}

impl Scripts {
    pub fn new() -> Self {
        let with_rotation = |body: &str| Script::new(&format!("{ROTATION}{body}"));

        Self {
            admit: with_rotation(ADMIT),
            checkout: with_rotation(CHECKOUT),
            release: with_rotation(RELEASE),
            requeue: with_rotation(REQUEUE),
            return_slot: Script::new(RETURN_SLOT),
            remove: Script::new(REMOVE),
            purge: Script::new(PURGE),
            recover: with_rotation(RECOVER),
            orphaned: Script::new(ORPHANED),
            set_has: with_rotation(SET_HAS),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("admit", &self.admit.get_hash())
            .field("checkout", &self.checkout.get_hash())
            .field("release", &self.release.get_hash())
            .finish_non_exhaustive()
    }
}
