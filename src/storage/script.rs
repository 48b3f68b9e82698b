//! Named atomic scripts
//!
//! Limiter state transitions must read the clock, compute, and write as one
//! indivisible step. Rather than accepting arbitrary script bodies, the
//! storage layer exposes a closed family of named scripts: the local backend
//! executes each one natively under its lock, the remote backend runs the
//! equivalent Lua body on the server. Both observe identical behavior.

/// The closed family of atomic scripts.
///
/// Conventions, per script (`keys` / `args` → reply):
///
/// | Script | keys | args | reply |
/// |--------|------|------|-------|
/// | `TokenBucketAcquire` | `[state]` | `[permits, burst, refill_per_sec, ttl_secs]` | `[accepted, balance]` |
/// | `TokenBucketRelease` | `[state]` | `[permits, burst, ttl_secs]` | `[balance]` |
/// | `TokenBucketPeek` | `[state]` | `[burst, refill_per_sec]` | `[balance, age_secs]` |
/// | `LeakyBucketAcquire` | `[state]` | `[permits, capacity, leak_per_sec, ttl_secs]` | `[accepted, level]` |
/// | `LeakyBucketRelease` | `[state]` | `[permits, ttl_secs]` | `[level]` |
/// | `LeakyBucketPeek` | `[state]` | `[leak_per_sec]` | `[level, age_secs]` |
/// | `SlidingWindowAcquire` | `[window]` | `[permits, rate, per_secs]` | `[accepted, count]` |
/// | `SlidingWindowCount` | `[window]` | `[per_secs]` | `[count]` |
///
/// Bucket state is encoded as `"balance|timestamp"` in a single value;
/// timestamps are seconds on the backend's own clock. `accepted` is 1.0 or
/// 0.0. Peek scripts never write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// Refill then conditionally debit a token bucket.
    TokenBucketAcquire,
    /// Credit a token bucket without touching its refill timestamp.
    TokenBucketRelease,
    /// Read a token bucket's current balance without mutating it.
    TokenBucketPeek,
    /// Drain then conditionally fill a leaky bucket.
    LeakyBucketAcquire,
    /// Drain a leaky bucket level after a cancelled admission.
    LeakyBucketRelease,
    /// Read a leaky bucket's current level without mutating it.
    LeakyBucketPeek,
    /// Prune a sliding window then conditionally record new instants.
    SlidingWindowAcquire,
    /// Prune a sliding window and report its population.
    SlidingWindowCount,
}

impl Script {
    /// Lua body executed by the remote backend.
    ///
    /// Every body derives `now` from the server clock (`TIME`) and returns
    /// numbers as strings so fractional balances survive the Lua-to-Redis
    /// conversion.
    pub(crate) fn lua(self) -> &'static str {
        match self {
            Script::TokenBucketAcquire => TOKEN_BUCKET_ACQUIRE_LUA,
            Script::TokenBucketRelease => TOKEN_BUCKET_RELEASE_LUA,
            Script::TokenBucketPeek => TOKEN_BUCKET_PEEK_LUA,
            Script::LeakyBucketAcquire => LEAKY_BUCKET_ACQUIRE_LUA,
            Script::LeakyBucketRelease => LEAKY_BUCKET_RELEASE_LUA,
            Script::LeakyBucketPeek => LEAKY_BUCKET_PEEK_LUA,
            Script::SlidingWindowAcquire => SLIDING_WINDOW_ACQUIRE_LUA,
            Script::SlidingWindowCount => SLIDING_WINDOW_COUNT_LUA,
        }
    }
}

const TOKEN_BUCKET_ACQUIRE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local permits = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local balance = burst
local last = now
local raw = redis.call('GET', KEYS[1])
if raw then
    local sep = string.find(raw, '|', 1, true)
    balance = tonumber(string.sub(raw, 1, sep - 1))
    last = tonumber(string.sub(raw, sep + 1))
end
balance = math.min(burst, balance + math.max(0, now - last) * rate)
local accepted = 0
if balance >= permits then
    balance = balance - permits
    accepted = 1
end
redis.call('SET', KEYS[1], balance .. '|' .. now, 'PX', math.ceil(ttl * 1000))
return {tostring(accepted), tostring(balance)}
"#;

const TOKEN_BUCKET_RELEASE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local permits = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local balance = burst
local last = now
local raw = redis.call('GET', KEYS[1])
if raw then
    local sep = string.find(raw, '|', 1, true)
    balance = tonumber(string.sub(raw, 1, sep - 1))
    last = tonumber(string.sub(raw, sep + 1))
    balance = math.min(burst, balance + permits)
end
redis.call('SET', KEYS[1], balance .. '|' .. last, 'PX', math.ceil(ttl * 1000))
return {tostring(balance)}
"#;

const TOKEN_BUCKET_PEEK_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {tostring(burst), '-1'}
end
local sep = string.find(raw, '|', 1, true)
local balance = tonumber(string.sub(raw, 1, sep - 1))
local last = tonumber(string.sub(raw, sep + 1))
local age = math.max(0, now - last)
balance = math.min(burst, balance + age * rate)
return {tostring(balance), tostring(age)}
"#;

const LEAKY_BUCKET_ACQUIRE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local permits = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local level = 0
local last = now
local raw = redis.call('GET', KEYS[1])
if raw then
    local sep = string.find(raw, '|', 1, true)
    level = tonumber(string.sub(raw, 1, sep - 1))
    last = tonumber(string.sub(raw, sep + 1))
end
level = math.max(0, level - math.max(0, now - last) * rate)
local accepted = 0
if level + permits <= capacity then
    level = level + permits
    accepted = 1
end
redis.call('SET', KEYS[1], level .. '|' .. now, 'PX', math.ceil(ttl * 1000))
return {tostring(accepted), tostring(level)}
"#;

const LEAKY_BUCKET_RELEASE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local permits = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local level = 0
local last = now
local raw = redis.call('GET', KEYS[1])
if raw then
    local sep = string.find(raw, '|', 1, true)
    level = math.max(0, tonumber(string.sub(raw, 1, sep - 1)) - permits)
    last = tonumber(string.sub(raw, sep + 1))
end
redis.call('SET', KEYS[1], level .. '|' .. last, 'PX', math.ceil(ttl * 1000))
return {tostring(level)}
"#;

const LEAKY_BUCKET_PEEK_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local rate = tonumber(ARGV[1])
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {'0', '-1'}
end
local sep = string.find(raw, '|', 1, true)
local level = tonumber(string.sub(raw, 1, sep - 1))
local last = tonumber(string.sub(raw, sep + 1))
local age = math.max(0, now - last)
level = math.max(0, level - age * rate)
return {tostring(level), tostring(age)}
"#;

const SLIDING_WINDOW_ACQUIRE_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local permits = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local per = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - per)
local count = redis.call('ZCARD', KEYS[1])
local accepted = 0
if count + permits <= rate then
    accepted = 1
    local seq = redis.call('INCRBY', KEYS[1] .. ':seq', permits)
    for i = 1, permits do
        redis.call('ZADD', KEYS[1], now, tostring(seq - permits + i))
    end
    count = count + permits
    redis.call('PEXPIRE', KEYS[1] .. ':seq', math.ceil(per * 2000))
end
redis.call('PEXPIRE', KEYS[1], math.ceil(per * 2000))
return {tostring(accepted), tostring(count)}
"#;

const SLIDING_WINDOW_COUNT_LUA: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local per = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - per)
return {tostring(redis.call('ZCARD', KEYS[1]))}
"#;
