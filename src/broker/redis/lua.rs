//! Server-side scripts. Every state transition of a message runs as one
//! script so concurrent workers and sweeps never observe half-moved state.
//!
//! Message hash fields: `envelope`, `origin` (`ready`/`delayed`/`dead`),
//! `due` (ms, delayed only), `timeout_ms`, and the three structure keys
//! `k_ready`, `k_delayed`, `k_dead` so a bare id can be routed back.

use redis::Script;

/// KEYS: message, ready, delayed, dead. ARGV: id, envelope, due_ms or "", timeout_ms.
/// Returns 0 when the id already exists (first copy wins).
const ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local origin = 'ready'
if ARGV[3] ~= '' then origin = 'delayed' end
redis.call('HSET', KEYS[1], 'envelope', ARGV[2], 'origin', origin, 'due', ARGV[3],
  'timeout_ms', ARGV[4], 'k_ready', KEYS[2], 'k_delayed', KEYS[3], 'k_dead', KEYS[4])
if origin == 'delayed' then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// KEYS: message, ready, delayed, dead, processing. ARGV: as ENQUEUE.
/// Drops every reference to the old copy, then stores the new one.
const REQUEUE: &str = r#"
redis.call('ZREM', KEYS[5], ARGV[1])
local old = redis.call('HMGET', KEYS[1], 'k_ready', 'k_delayed', 'k_dead')
if old[1] then
  redis.call('LREM', old[1], 0, ARGV[1])
  redis.call('ZREM', old[2], ARGV[1])
  redis.call('LREM', old[3], 0, ARGV[1])
end
redis.call('DEL', KEYS[1])
local origin = 'ready'
if ARGV[3] ~= '' then origin = 'delayed' end
redis.call('HSET', KEYS[1], 'envelope', ARGV[2], 'origin', origin, 'due', ARGV[3],
  'timeout_ms', ARGV[4], 'k_ready', KEYS[2], 'k_delayed', KEYS[3], 'k_dead', KEYS[4])
if origin == 'delayed' then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// KEYS: processing, then ready/delayed/dead for each tier in visiting order.
/// ARGV: now_ms, mode (`normal`/`delayed`/`dead`), message key prefix.
/// Returns `{id, envelope}` or nil. Stale references are discarded.
const FETCH: &str = r#"
local now = tonumber(ARGV[1])
local mode = ARGV[2]
local function claim(id, origin)
  local f = redis.call('HMGET', ARGV[3] .. id, 'envelope', 'origin', 'timeout_ms')
  if not f[1] or f[2] ~= origin then return nil end
  if redis.call('ZSCORE', KEYS[1], id) then return nil end
  redis.call('ZADD', KEYS[1], now + (tonumber(f[3]) or 0), id)
  return f[1]
end
for tier = 0, 2 do
  local ready = KEYS[2 + tier * 3]
  local delayed = KEYS[3 + tier * 3]
  local dead = KEYS[4 + tier * 3]
  if mode == 'dead' then
    while true do
      local id = redis.call('RPOP', dead)
      if not id then break end
      local env = claim(id, 'dead')
      if env then return {id, env} end
    end
  else
    while true do
      local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now, 'LIMIT', 0, 1)
      if #due == 0 then break end
      redis.call('ZREM', delayed, due[1])
      local env = claim(due[1], 'delayed')
      if env then return {due[1], env} end
    end
    if mode == 'normal' then
      while true do
        local id = redis.call('RPOP', ready)
        if not id then break end
        local env = claim(id, 'ready')
        if env then return {id, env} end
      end
    end
  end
end
return false
"#;

/// KEYS: processing. ARGV: id, message key prefix.
/// Returns 0 and touches nothing when the id was not in flight.
const ACK: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
local key = ARGV[2] .. ARGV[1]
local f = redis.call('HMGET', key, 'k_ready', 'k_delayed', 'k_dead')
if f[1] then
  redis.call('LREM', f[1], 0, ARGV[1])
  redis.call('ZREM', f[2], ARGV[1])
  redis.call('LREM', f[3], 0, ARGV[1])
end
redis.call('DEL', key)
return 1
"#;

/// KEYS: processing. ARGV: id, message key prefix. Returns 0 for unknown deliveries.
const NACK: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
local key = ARGV[2] .. ARGV[1]
local dead = redis.call('HGET', key, 'k_dead')
if not dead then return 0 end
redis.call('HSET', key, 'origin', 'dead')
redis.call('LPUSH', dead, ARGV[1])
return 1
"#;

/// KEYS: processing. ARGV: id, message key prefix, now_ms.
/// Returns 0 when the id was not in flight, so concurrent sweeps reclaim once.
const REJECT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
local key = ARGV[2] .. ARGV[1]
local f = redis.call('HMGET', key, 'origin', 'due', 'k_ready', 'k_delayed', 'k_dead')
if not f[1] then return 0 end
if f[1] == 'delayed' then
  redis.call('ZADD', f[4], tonumber(f[2]) or tonumber(ARGV[3]), ARGV[1])
elseif f[1] == 'dead' then
  redis.call('LPUSH', f[5], ARGV[1])
else
  redis.call('LPUSH', f[3], ARGV[1])
end
return 1
"#;

/// KEYS: processing, then every structure key of the queue. ARGV: message key prefix.
/// Deletes messages at rest; in-flight ones are left to their workers.
const FLUSH: &str = r#"
local removed = 0
for i = 2, #KEYS do
  local kind = redis.call('TYPE', KEYS[i]).ok
  local ids = {}
  if kind == 'list' then
    ids = redis.call('LRANGE', KEYS[i], 0, -1)
  elseif kind == 'zset' then
    ids = redis.call('ZRANGE', KEYS[i], 0, -1)
  end
  for _, id in ipairs(ids) do
    if not redis.call('ZSCORE', KEYS[1], id) then
      removed = removed + redis.call('DEL', ARGV[1] .. id)
    end
  end
  redis.call('DEL', KEYS[i])
end
return removed
"#;

pub(crate) struct Scripts {
    pub enqueue: Script,
    pub requeue: Script,
    pub fetch: Script,
    pub ack: Script,
    pub nack: Script,
    pub reject: Script,
    pub flush: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            requeue: Script::new(REQUEUE),
            fetch: Script::new(FETCH),
            ack: Script::new(ACK),
            nack: Script::new(NACK),
            reject: Script::new(REJECT),
            flush: Script::new(FLUSH),
        }
    }
}
