use async_trait::async_trait;

use crate::event_sourcing::core::{
    Agent, Aggregate, AggregateId, EventSourcingError, Version, VersionedAggregate,
};

use super::event_sourcing_service::EventSourcingService;

/// Typed façade over `EventSourcingService` for one domain aggregate.
///
/// Implementors supply the capability methods; the provided methods handle
/// id mapping and soft deletion.
#[async_trait]
pub trait AggregateService: Send + Sync {
    type Aggregate: Aggregate;
    /// Feature-level identifier, mapped to an `AggregateId` by `to_aggregate_id`
    type Id: Send + Sync;

    fn event_sourcing(&self) -> &EventSourcingService<Self::Aggregate>;

    fn to_aggregate_id(&self, id: &Self::Id) -> AggregateId;

    /// Soft-deleted aggregates are hidden from `get*`
    fn is_removed(&self, aggregate: &Self::Aggregate) -> bool;

    async fn get(
        &self,
        id: &Self::Id,
    ) -> Result<Option<VersionedAggregate<Self::Aggregate>>, EventSourcingError> {
        let result = self
            .event_sourcing()
            .aggregate_latest(&self.to_aggregate_id(id))
            .await;
        self.visible(result)
    }

    async fn get_at(
        &self,
        id: &Self::Id,
        version: Version,
    ) -> Result<Option<VersionedAggregate<Self::Aggregate>>, EventSourcingError> {
        let result = self
            .event_sourcing()
            .aggregate(&self.to_aggregate_id(id), version)
            .await;
        self.visible(result)
    }

    async fn get_or_throw(
        &self,
        id: &Self::Id,
    ) -> Result<VersionedAggregate<Self::Aggregate>, EventSourcingError> {
        self.get(id).await?.ok_or_else(|| self.not_found(id))
    }

    async fn get_or_throw_at(
        &self,
        id: &Self::Id,
        version: Version,
    ) -> Result<VersionedAggregate<Self::Aggregate>, EventSourcingError> {
        self.get_at(id, version).await?.ok_or_else(|| self.not_found(id))
    }

    async fn dispatch_command(
        &self,
        id: &Self::Id,
        expected_version: Version,
        agent: &Agent,
        command: &<Self::Aggregate as Aggregate>::Command,
    ) -> Result<Version, EventSourcingError> {
        self.event_sourcing()
            .dispatch_command(&self.to_aggregate_id(id), expected_version, agent, command)
            .await
    }

    async fn dispatch_command_to_latest(
        &self,
        id: &Self::Id,
        agent: &Agent,
        command: &<Self::Aggregate as Aggregate>::Command,
    ) -> Result<Version, EventSourcingError> {
        self.event_sourcing()
            .dispatch_command_to_latest(&self.to_aggregate_id(id), agent, command)
            .await
    }

    async fn collapse_events(
        &self,
        id: &Self::Id,
        version: Version,
        agent: &Agent,
    ) -> Result<bool, EventSourcingError> {
        self.event_sourcing()
            .collapse_events(&self.to_aggregate_id(id), version, agent)
            .await
    }

    #[doc(hidden)]
    fn visible(
        &self,
        result: Result<VersionedAggregate<Self::Aggregate>, EventSourcingError>,
    ) -> Result<Option<VersionedAggregate<Self::Aggregate>>, EventSourcingError> {
        match result {
            Ok(loaded) if self.is_removed(&loaded.aggregate) => Ok(None),
            Ok(loaded) => Ok(Some(loaded)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[doc(hidden)]
    fn not_found(&self, id: &Self::Id) -> EventSourcingError {
        EventSourcingError::AggregateNotFound {
            aggregate_id: self.to_aggregate_id(id),
            aggregate_type: <Self::Aggregate as Aggregate>::aggregate_type(),
        }
    }
}
