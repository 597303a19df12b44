//! Optimistic read-modify-write helper.

use tracing::debug;

use drover_core::{Error, Result};

use crate::object::AsObject;
use crate::store::Objectbase;

/// Attempts before a persistent conflict is reported to the caller.
pub const MAX_MODIFY_ATTEMPTS: u32 = 10;

/// Apply `mutate` to `object` and write it, re-reading and reapplying on conflicts.
///
/// `mutate` returns whether it changed anything and a value passed back to
/// the caller. Unchanged objects are not written. After a `Modified` conflict
/// the object is refreshed in place from the store and `mutate` runs again.
///
/// # Errors
///
/// Returns store errors other than `Modified`, and `Modified` itself after
/// [`MAX_MODIFY_ATTEMPTS`] conflicting writes.
pub async fn modify<O, R, F>(store: &dyn Objectbase, object: &mut O, mut mutate: F) -> Result<R>
where
    O: AsObject + Send + ?Sized,
    F: FnMut(&mut O) -> (bool, R) + Send,
    R: Send,
{
    let mut attempt = 0;
    loop {
        let (changed, value) = mutate(object);
        if !changed {
            return Ok(value);
        }
        match store.set_object(object.as_object_mut()).await {
            Ok(()) => return Ok(value),
            Err(e) if e.is_modified() && attempt < MAX_MODIFY_ATTEMPTS => {
                attempt += 1;
                let id = object.as_object().id().clone();
                debug!(object = %id, attempt, "Conflicting write, reloading");
                let fresh = store.get_object(&id).await?;
                if !object.as_object_mut().assign(fresh.as_ref()) {
                    return Err(Error::invalid_object(format!(
                        "{id} changed its concrete type in the store"
                    )));
                }
            }
            Err(e) => return Err(e),
        }
    }
}
