use redis::Script;
use std::sync::LazyLock;

/// Atomically pops the head (or tail, for LIFO) of the pending list and
/// reads its hash entry. If ephemeral storage is enabled the entry is
/// re-stamped into the sorted set with the take instant as score so
/// `orphans` can find it later; otherwise the hash entry is deleted on
/// the spot, since nothing else will ever reference that id again.
///
/// KEYS[1] = list, KEYS[2] = hash, KEYS[3] = sorted set
/// ARGV[1] = "L" (LPOP, fifo) or "R" (RPOP, lifo)
/// ARGV[2] = take-instant millis
/// ARGV[3] = "1" if ephemeral storage is enabled, "0" otherwise
///
/// Returns a two-element array `{id, payload}` or false (nil) if the
/// list was empty.
pub static TAKE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(TAKE_LUA));

const TAKE_LUA: &str = r#"
local id
if ARGV[1] == "L" then
    id = redis.call("LPOP", KEYS[1])
else
    id = redis.call("RPOP", KEYS[1])
end
if not id then
    return false
end
local payload = redis.call("HGET", KEYS[2], id)
if ARGV[3] == "1" then
    redis.call("ZADD", KEYS[3], ARGV[2], id)
else
    redis.call("HDEL", KEYS[2], id)
end
return {id, payload}
"#;

/// Atomically removes `id` from the sorted set and deletes its hash
/// field. Idempotent: succeeds whether or not `id` was present.
///
/// KEYS[1] = sorted set, KEYS[2] = hash
/// ARGV[1] = id
pub static FINALIZE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(FINALIZE_LUA));

const FINALIZE_LUA: &str = r#"
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("HDEL", KEYS[2], ARGV[1])
return 1
"#;

/// Atomically stores a new message's hash entry and pushes its id
/// onto the pending list, but only if the id isn't already present —
/// this is what gives `enqueue` its "commit or no-op" semantics on a
/// duplicate id.
///
/// KEYS[1] = hash, KEYS[2] = list
/// ARGV[1] = id, ARGV[2] = encoded record bytes
///
/// Returns 1 if the message was newly stored, 0 if `id` already
/// existed. Always appends to the tail; `take` picks the head for
/// FIFO delivery or the tail for LIFO.
pub static ENQUEUE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(ENQUEUE_LUA));

const ENQUEUE_LUA: &str = r#"
local inserted = redis.call("HSETNX", KEYS[1], ARGV[1], ARGV[2])
if inserted == 1 then
    redis.call("RPUSH", KEYS[2], ARGV[1])
end
return inserted
"#;
