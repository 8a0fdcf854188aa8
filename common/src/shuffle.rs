use fnv::FnvHasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hasher;
use thiserror::Error;

/* --------- Formato de mensajes mapper/reducer <-> agente --------- */

/// Un registro (clave, valor) sin tipo fijo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: Value,
    pub value: Value,
}

impl KvPair {
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Salida de un mapper (y contenido de una partición intermedia o de salida).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvPairArray {
    #[serde(default)]
    pub pairs: Vec<KvPair>,
}

/// Entrada de un reducer: una clave con todos sus valores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedPair {
    pub key: Value,
    pub value: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum ShuffleError {
    #[error("mensaje vacío")]
    Empty,
    #[error("mensaje mal formado: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("no se pudo serializar el mensaje: {0}")]
    Encode(#[source] serde_json::Error),
}

/* --------- Particionado --------- */

/// FNV-1a de 64 bits recortado a 31 bits. Se usa en lugar de DefaultHasher
/// porque el resultado tiene que coincidir entre procesos.
pub fn ihash(bytes: &[u8]) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// Forma canónica de la clave: su codificación JSON.
fn canonical_key(key: &Value) -> String {
    // serializar un Value no falla; los objetos quedan con claves ordenadas
    serde_json::to_string(key).unwrap_or_default()
}

pub fn key_hash(key: &Value) -> u32 {
    ihash(canonical_key(key).as_bytes())
}

/// partition(key) = hash(key) mod N
pub fn partition(key: &Value, n_reducers: u32) -> u32 {
    key_hash(key) % n_reducers.max(1)
}

/// Reparte los pares en N buckets (siempre N, aunque queden vacíos),
/// preservando el orden de llegada dentro de cada bucket.
pub fn partition_pairs(pairs: Vec<KvPair>, n_reducers: u32) -> Vec<Vec<KvPair>> {
    let n = n_reducers.max(1);
    let mut buckets: Vec<Vec<KvPair>> = (0..n).map(|_| Vec::new()).collect();
    for pair in pairs {
        let pid = partition(&pair.key, n) as usize;
        buckets[pid].push(pair);
    }
    buckets
}

/// Agrupa por clave sobre todas las particiones recibidas.
/// Las claves salen en el orden en que se vieron por primera vez.
pub fn group_by_key<I>(pairs: I) -> Vec<GroupedPair>
where
    I: IntoIterator<Item = KvPair>,
{
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<GroupedPair> = Vec::new();

    for pair in pairs {
        let canon = canonical_key(&pair.key);
        match index.get(&canon) {
            Some(&i) => groups[i].value.push(pair.value),
            None => {
                index.insert(canon, groups.len());
                groups.push(GroupedPair {
                    key: pair.key,
                    value: vec![pair.value],
                });
            }
        }
    }
    groups
}

/* --------- Codificación --------- */

/// Decodifica un mensaje leído completo del canal. Se recorta el relleno
/// (NUL y espacios) antes de parsear.
pub fn decode_message<T: DeserializeOwned>(raw: &[u8]) -> Result<T, ShuffleError> {
    let start = raw
        .iter()
        .position(|b| !is_padding(*b))
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !is_padding(*b))
        .map(|i| i + 1)
        .unwrap_or(start);
    let body = &raw[start..end];
    if body.is_empty() {
        return Err(ShuffleError::Empty);
    }
    serde_json::from_slice(body).map_err(ShuffleError::Malformed)
}

fn is_padding(b: u8) -> bool {
    b == 0 || b.is_ascii_whitespace()
}

pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ShuffleError> {
    serde_json::to_vec(msg).map_err(ShuffleError::Encode)
}
