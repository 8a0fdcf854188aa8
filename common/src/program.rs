//! Lado "programa de usuario" del canal: lo que usa un mapper o un reducer
//! para hablar con el agente que lo lanzó.

use std::time::Duration;

use crate::channel::{
    send_message, socket_from_env, ChannelError, ChannelSettings, MessageListener,
    INPUT_SOCKET_ENV, OUTPUT_SOCKET_ENV,
};
use crate::shuffle::{GroupedPair, KvPair, KvPairArray};

/// Mapper: manda todos los pares emitidos en un único mensaje.
pub async fn emit_pairs(pairs: Vec<KvPair>, settings: &ChannelSettings) -> Result<(), ChannelError> {
    let out = socket_from_env(OUTPUT_SOCKET_ENV)?;
    send_message(&out, &KvPairArray { pairs }, settings).await
}

/// Reducer: escucha en su socket de entrada y espera el grupo (clave, valores).
pub async fn receive_group(timeout: Duration) -> Result<GroupedPair, ChannelError> {
    let input = socket_from_env(INPUT_SOCKET_ENV)?;
    let listener = MessageListener::bind(input)?;
    listener.receive(timeout).await
}

/// Reducer: devuelve el resultado reducido para la clave recibida.
pub async fn emit_result(pair: &KvPair, settings: &ChannelSettings) -> Result<(), ChannelError> {
    let out = socket_from_env(OUTPUT_SOCKET_ENV)?;
    send_message(&out, pair, settings).await
}
