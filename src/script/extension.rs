/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! The fixed set of functions registered into every worker's
//! interpreter. Their names and behaviour are the external contract of
//! the script host surface.

use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use mlua::{Lua, MultiValue, Table as LuaTable, Value as LuaValue, Variadic};
use tracing::{debug, info};

use crate::bridge::{dispatch, library, signature::Signature};
use crate::message::table::ParamTable;
use crate::script::{convert, ScriptContext};

/// Pure-Lua helper registered in every interpreter. Kept as source so
/// scripts can rely on identical merge semantics everywhere.
const MERGETABLES_LUA: &str = r#"
function mergetables(t1, t2)
    local result = {}

    for k, v in pairs(t1) do
        if type(v) == "table" then
            result[k] = mergetables(v, {}) -- clone instead of copying the reference to v
        else
            result[k] = v
        end
    end

    for k, v in pairs(t2) do
        if type(v) == "table" then
            if result[k] == nil then
                result[k] = mergetables(v, {}) -- clone instead of copying the reference to v
            elseif type(result[k]) == "table" then
                result[k] = mergetables(v, result[k])
            else
                error("Cannot merge table with non-table value at key: " .. tostring(k))
            end
        elseif result[k] == nil then
            result[k] = v
        elseif result[k] ~= v then
            error("Cannot merge two different non-table values at key: " .. tostring(k))
        end
    end

    local mt1 = getmetatable(t1)
    local mt2 = getmetatable(t2)

    if mt1 then
        setmetatable(result, mergetables(mt1, {}))
    end

    if mt2 then
        setmetatable(result, mergetables(mt2, getmetatable(result) or {}))
    end
    return result
end
"#;

lazy_static! {
    // Anchors the steady clock to the system clock once, so `time()`
    // is monotonic while staying epoch-based.
    static ref TIME_ANCHOR: (Instant, u128) = (
        Instant::now(),
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos(),
    );
}

fn epoch_time_1e8() -> i64 {
    let nanos = TIME_ANCHOR.1 + TIME_ANCHOR.0.elapsed().as_nanos();
    (nanos / 10) as i64
}

fn with_separator(path: &Path) -> String {
    format!("{}{}", path.display(), std::path::MAIN_SEPARATOR)
}

fn pointer_argument(value: &LuaValue, function: &str) -> mlua::Result<usize> {
    match value {
        LuaValue::LightUserData(pointer) => Ok(pointer.0 as usize),
        LuaValue::Integer(addr) => Ok(*addr as usize),
        other => Err(mlua::Error::RuntimeError(format!(
            "function {function} expects an address as first argument, got {}",
            other.type_name()
        ))),
    }
}

/// Registers the script host surface into `lua` for the worker
/// described by `ctx`.
pub(crate) fn install(lua: &Lua, ctx: &Arc<ScriptContext>) -> mlua::Result<()> {
    let globals = lua.globals();

    {
        let ctx = ctx.clone();
        globals.set(
            "addagent",
            lua.create_function(move |_, (name, code, messages): (String, String, LuaTable)| {
                let host = ctx.host.upgrade().ok_or_else(|| {
                    mlua::Error::RuntimeError("cannot add agents while the runtime shuts down".into())
                })?;
                let agent = host
                    .add_scripted_code(&name, ctx.script_path.clone(), code)
                    .map_err(mlua::Error::external)?;
                for message_name in messages.sequence_values::<String>() {
                    let message_name = message_name?;
                    agent
                        .add_message(&message_name, ParamTable::new(), "", "", "")
                        .map_err(mlua::Error::external)?;
                }
                Ok(())
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "addmessage",
            lua.create_function(move |_, (name, params): (String, Option<LuaTable>)| {
                if ctx.is_replica {
                    debug!(
                        "ignoring addmessage from a replicated worker; scripts can check with isreplicated()"
                    );
                    return Ok(());
                }
                let params = match params {
                    Some(table) => convert::lua_table_to_param(&table)?,
                    None => ParamTable::new(),
                };
                let display_name = params.get_str("displayname").unwrap_or_default().to_string();
                let description = params.get_str("description").unwrap_or_default().to_string();
                let descriptions = params.sub_table("parameters").cloned().unwrap_or_default();

                let icon = params.get_str("icon").unwrap_or_default().to_string();
                let icon_path = if icon.is_empty() {
                    String::new()
                } else {
                    let resolved = ctx
                        .script_path
                        .parent()
                        .unwrap_or_else(|| Path::new(""))
                        .join(&icon);
                    if !resolved.exists() {
                        return Err(mlua::Error::RuntimeError(format!(
                            "message '{name}' of agent '{}' specifies a non-existent icon {}",
                            ctx.agent.name(),
                            resolved.display()
                        )));
                    }
                    resolved.display().to_string()
                };

                ctx.agent
                    .add_message(&name, descriptions, &display_name, &description, &icon_path)
                    .map_err(mlua::Error::external)?;
                debug!(message = %name, script = %ctx.script_path.display(), "added message");
                Ok(())
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "send",
            lua.create_function(move |_, (agent, message, params): (String, String, LuaTable)| {
                let mut parameters = convert::lua_table_to_param(&params)?;
                if parameters.reply_to_agent().is_none() {
                    parameters.set_reply_to_agent(&ctx.agent.name());
                }
                let host = ctx.host.upgrade().ok_or_else(|| {
                    mlua::Error::RuntimeError("cannot send while the runtime shuts down".into())
                })?;
                let agent_message =
                    host.get_message(&agent, &message).map_err(mlua::Error::external)?;
                agent_message.send(parameters).map_err(mlua::Error::external)
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "import",
            lua.create_function(
                move |lua, (library_name, function_name, signature): (String, String, String)| {
                    let signature = Signature::parse(&signature).map_err(mlua::Error::external)?;
                    dispatch::validate_shape(&signature).map_err(mlua::Error::external)?;
                    if dispatch::is_imported(&function_name) {
                        return Err(mlua::Error::RuntimeError(format!(
                            "import: function '{function_name}' is registered more than once"
                        )));
                    }

                    let path = library::resolve(&library_name, ctx.script_path.parent())
                        .map_err(mlua::Error::external)?;
                    let loaded = library::load(&path).map_err(mlua::Error::external)?;
                    let symbol = loaded.symbol(&function_name).map_err(mlua::Error::external)?;

                    debug!(
                        function = %function_name,
                        library = %path.display(),
                        signature = %signature.canonical(),
                        "imported native function"
                    );

                    dispatch::store_imported(
                        &function_name,
                        dispatch::ImportedFunction { library: loaded, symbol, signature },
                    );

                    let dispatch_name = function_name.clone();
                    let stub = lua.create_function(move |lua, args: MultiValue| {
                        dispatch::call_imported(lua, &dispatch_name, args)
                    })?;
                    lua.globals().set(function_name, stub)?;
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "isreplicated",
            lua.create_function(move |_, ()| Ok(ctx.is_replica))?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "getconfig",
            lua.create_function(move |lua, ()| {
                convert::param_table_to_lua(lua, &ctx.agent.configuration().table())
            })?,
        )?;
    }

    {
        let ctx = ctx.clone();
        globals.set(
            "setconfig",
            lua.create_function(move |_, table: LuaTable| {
                ctx.agent.configuration().set_table(convert::lua_table_to_param(&table)?);
                Ok(())
            })?,
        )?;
    }

    globals.set(
        "log",
        lua.create_function(|_, line: String| {
            info!(target: "script", "{line}");
            Ok(())
        })?,
    )?;

    globals.set("time", lua.create_function(|_, ()| Ok(epoch_time_1e8()))?)?;

    globals.set(
        "cores",
        lua.create_function(|_, ()| {
            Ok(std::thread::available_parallelism().map(|cores| cores.get() as i64).unwrap_or(1))
        })?,
    )?;

    globals.set(
        "currentdir",
        lua.create_function(|_, ()| {
            std::env::current_dir().map(|dir| with_separator(&dir)).map_err(mlua::Error::external)
        })?,
    )?;

    globals.set(
        "homedir",
        lua.create_function(|_, ()| {
            Ok(dirs::home_dir().map(|dir| with_separator(&dir)).unwrap_or_default())
        })?,
    )?;

    globals.set(
        "env",
        lua.create_function(|_, name: String| Ok(std::env::var(&name).unwrap_or_default()))?,
    )?;

    {
        let ctx = ctx.clone();
        globals.set(
            "scriptdir",
            lua.create_function(move |_, ()| {
                Ok(ctx
                    .script_path
                    .parent()
                    .map(with_separator)
                    .unwrap_or_default())
            })?,
        )?;
    }

    globals.set(
        "userdatadir",
        lua.create_function(|_, ()| {
            Ok(dirs::data_dir().map(|dir| with_separator(&dir)).unwrap_or_default())
        })?,
    )?;

    globals.set(
        "mktemp",
        lua.create_function(|_, ()| {
            let dir = tempfile::Builder::new()
                .prefix("luahive-")
                .tempdir()
                .map_err(mlua::Error::external)?;
            Ok(dir.into_path().display().to_string())
        })?,
    )?;

    {
        let ctx = ctx.clone();
        globals.set(
            "readfile",
            lua.create_function(move |_, path: String| {
                let mut file = PathBuf::from(&path);
                if file.is_relative() {
                    if let Some(dir) = ctx.script_path.parent() {
                        file = dir.join(file);
                    }
                }
                std::fs::read_to_string(&file).map_err(mlua::Error::external)
            })?,
        )?;
    }

    globals.set(
        "printtable",
        lua.create_function(|_, table: LuaTable| {
            print!("{}", convert::lua_table_to_param(&table)?);
            Ok(())
        })?,
    )?;

    globals.set(
        "peek",
        lua.create_function(|_, args: Variadic<LuaValue>| {
            let addr = pointer_argument(args.first().unwrap_or(&LuaValue::Nil), "peek")?;
            let bytes = match args.get(1) {
                Some(LuaValue::Integer(bytes)) => *bytes,
                _ => 1,
            };
            peek_memory(addr, bytes)
        })?,
    )?;

    globals.set(
        "poke",
        lua.create_function(|_, args: Variadic<LuaValue>| {
            let addr = pointer_argument(args.first().unwrap_or(&LuaValue::Nil), "poke")?;
            let value = args.get(1).cloned().unwrap_or(LuaValue::Nil);
            let bytes = match args.get(2) {
                Some(LuaValue::Integer(bytes)) => *bytes,
                _ => 1,
            };
            poke_memory(addr, &value, bytes)
        })?,
    )?;

    globals.set(
        "addoffset",
        lua.create_function(|_, args: Variadic<LuaValue>| {
            let addr = pointer_argument(args.first().unwrap_or(&LuaValue::Nil), "addoffset")?;
            let offset = match args.get(1) {
                Some(LuaValue::Integer(offset)) => *offset,
                _ => 0,
            };
            let bytes = match args.get(2) {
                Some(LuaValue::Integer(bytes)) => *bytes,
                _ => 1,
            };
            let stride: usize = match bytes {
                0 | 1 => 1,
                2 => 2,
                4 => 4,
                8 => 8,
                16 => 16,
                -8 => 8,
                unsupported => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "Error running function 'addoffset': Number of bytes must be either 1,2,4,8,16 or -8 (for floating point). {unsupported} is not supported."
                    )))
                }
            };
            let result = addr.wrapping_add_signed(offset as isize * stride as isize);
            Ok(mlua::LightUserData(result as *mut c_void))
        })?,
    )?;

    lua.load(MERGETABLES_LUA).set_name("mergetables").exec()?;

    Ok(())
}

fn peek_memory(addr: usize, bytes: i64) -> mlua::Result<LuaValue> {
    // Raw memory probes mirror the widths the native boundary deals in.
    unsafe {
        Ok(match bytes {
            0 | 1 => LuaValue::Integer(i64::from(*(addr as *const u8))),
            2 => LuaValue::Integer(i64::from(*(addr as *const u16))),
            4 => LuaValue::Integer(i64::from(*(addr as *const u32))),
            8 => LuaValue::Integer(*(addr as *const u64) as i64),
            16 => LuaValue::Integer(*(addr as *const u128) as i64),
            -8 => LuaValue::Number(*(addr as *const f64)),
            unsupported => {
                return Err(mlua::Error::RuntimeError(format!(
                    "Error running function 'peek': Number of bytes must be either 1,2,4,8,16 or -8 (for floating point). {unsupported} is not supported."
                )))
            }
        })
    }
}

fn poke_memory(addr: usize, value: &LuaValue, bytes: i64) -> mlua::Result<()> {
    let integer = match value {
        LuaValue::Integer(number) => *number,
        LuaValue::Number(number) => *number as i64,
        _ if bytes != -8 => {
            return Err(mlua::Error::RuntimeError(
                "function poke expects a numeric value as second argument".into(),
            ))
        }
        _ => 0,
    };
    // Integer widths wrap on overflow.
    unsafe {
        match bytes {
            0 | 1 => *(addr as *mut u8) = integer as u8,
            2 => *(addr as *mut u16) = integer as u16,
            4 => *(addr as *mut u32) = integer as u32,
            8 => *(addr as *mut u64) = integer as u64,
            16 => *(addr as *mut u128) = integer as u128,
            -8 => {
                let number = match value {
                    LuaValue::Number(number) => *number,
                    LuaValue::Integer(number) => *number as f64,
                    _ => {
                        return Err(mlua::Error::RuntimeError(
                            "function poke expects a numeric value as second argument".into(),
                        ))
                    }
                };
                *(addr as *mut f64) = number;
            }
            unsupported => {
                return Err(mlua::Error::RuntimeError(format!(
                    "Error running function 'poke': Number of bytes must be either 1,2,4,8,16 or -8. {unsupported} is not supported."
                )))
            }
        }
    }
    Ok(())
}
