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

//! Conversion between script-host tables and parameter tables.
//!
//! Light userdata whose address is known to the managed store converts
//! to a ref-counted pointer value, so script-to-script pointer passing
//! keeps the backing buffer alive.

use mlua::{LightUserData, Lua, Table as LuaTable, Value as LuaValue};

use crate::bridge::managed::ManagedPtr;
use crate::message::table::{ParamTable, Value};

pub(crate) fn value_to_lua(lua: &Lua, value: &Value) -> mlua::Result<LuaValue> {
    Ok(match value {
        Value::Int(number) => LuaValue::Integer(*number),
        Value::Num(number) => LuaValue::Number(*number),
        Value::Bool(flag) => LuaValue::Boolean(*flag),
        Value::Str(text) => LuaValue::String(lua.create_string(text)?),
        Value::Ptr(pointer) => {
            LuaValue::LightUserData(LightUserData(pointer.addr() as *mut std::os::raw::c_void))
        }
    })
}

pub(crate) fn lua_to_value(value: &LuaValue) -> mlua::Result<Value> {
    match value {
        LuaValue::Integer(number) => Ok(Value::Int(*number)),
        LuaValue::Number(number) => Ok(Value::Num(*number)),
        LuaValue::Boolean(flag) => Ok(Value::Bool(*flag)),
        LuaValue::String(text) => Ok(Value::Str(text.to_string_lossy().to_string())),
        LuaValue::LightUserData(pointer) => {
            Ok(Value::Ptr(ManagedPtr::from_addr(pointer.0 as usize)))
        }
        other => Err(mlua::Error::RuntimeError(format!(
            "cannot carry a {} inside message parameters",
            other.type_name()
        ))),
    }
}

/// Converts a parameter table into a script table.
pub(crate) fn param_table_to_lua(lua: &Lua, table: &ParamTable) -> mlua::Result<LuaTable> {
    let out = lua.create_table()?;
    for (key, value) in &table.data {
        out.set(value_to_lua(lua, key)?, value_to_lua(lua, value)?)?;
    }
    for (key, sub) in &table.sub_tables {
        out.set(value_to_lua(lua, key)?, param_table_to_lua(lua, sub)?)?;
    }
    Ok(out)
}

/// Converts a script table into a parameter table.
///
/// Table-valued entries become sub-tables; everything else must be a
/// scalar of the value domain.
pub(crate) fn lua_table_to_param(table: &LuaTable) -> mlua::Result<ParamTable> {
    let mut out = ParamTable::new();
    for pair in table.pairs::<LuaValue, LuaValue>() {
        let (key, value) = pair?;
        let key = lua_to_value(&key)?;
        match value {
            LuaValue::Table(sub) => {
                out.sub_tables.insert(key, lua_table_to_param(&sub)?);
            }
            scalar => {
                out.data.insert(key, lua_to_value(&scalar)?);
            }
        }
    }
    Ok(out)
}
