//! 事件扇出
//!
//! 尽力而为的推送：目标离线、缓冲已满或连接已关闭时事件被丢弃，从不向调用方报错。
//! 扇出基于注册表的成员快照，投递发生在注册表锁之外。

use std::sync::Arc;

use config::ReportAudience;
use domain::{
    CommunityId, ConnectionHandle, ConnectionRegistry, Delivery, PostId, Room, ServerEvent, UserId,
};
use serde_json::Value;
use tracing::{debug, warn};

pub struct EventFanout {
    registry: Arc<dyn ConnectionRegistry>,
    report_audience: ReportAudience,
}

impl EventFanout {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, report_audience: ReportAudience) -> Self {
        Self {
            registry,
            report_audience,
        }
    }

    /// 新帖子推送到社区房间，作者除外
    pub async fn publish_post_created(
        &self,
        community_id: CommunityId,
        author_id: UserId,
        post: Value,
    ) -> usize {
        self.publish_to_room(
            Room::Community(community_id),
            ServerEvent::PostCreated(post),
            Some(author_id),
        )
        .await
    }

    /// 新评论推送到帖子房间，评论者除外
    pub async fn publish_comment_created(
        &self,
        post_id: PostId,
        commenter_id: UserId,
        comment: Value,
    ) -> usize {
        self.publish_to_room(
            Room::Post(post_id),
            ServerEvent::CommentCreated(comment),
            Some(commenter_id),
        )
        .await
    }

    /// 投票计数推送到社区房间，不过滤
    pub async fn publish_poll_tally(
        &self,
        community_id: CommunityId,
        post_id: PostId,
        tally: Value,
    ) -> usize {
        self.publish_to_room(
            Room::Community(community_id),
            ServerEvent::PollTally { post_id, tally },
            None,
        )
        .await
    }

    /// 通知推送到目标用户的个人房间
    pub async fn publish_notification(&self, user_id: UserId, notification: Value) -> usize {
        self.publish_to_room(
            Room::User(user_id),
            ServerEvent::Notification(notification),
            None,
        )
        .await
    }

    /// 举报推送，范围由配置决定
    pub async fn publish_report_opened(&self, report: Value) -> usize {
        let event = ServerEvent::ReportOpened(report);
        match self.report_audience {
            ReportAudience::All => {
                let targets = self.registry.all_connections().await;
                self.deliver_all(&targets, event, None)
            }
            ReportAudience::Moderators => self.publish_to_room(Room::Moderators, event, None).await,
        }
    }

    /// 向房间当前成员推送，返回成功入队的连接数
    pub async fn publish_to_room(
        &self,
        room: Room,
        event: ServerEvent,
        exclude: Option<UserId>,
    ) -> usize {
        let members = self.registry.room_members(room).await;
        if members.is_empty() {
            debug!(room = %room, kind = event.kind(), "no live members, event dropped");
            return 0;
        }
        self.deliver_all(&members, event, exclude)
    }

    fn deliver_all(
        &self,
        targets: &[ConnectionHandle],
        event: ServerEvent,
        exclude: Option<UserId>,
    ) -> usize {
        let mut delivered = 0;
        for handle in targets {
            if Some(handle.user_id) == exclude {
                continue;
            }
            match handle.deliver(event.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::BufferFull => warn!(
                    user_id = %handle.user_id,
                    connection_id = %handle.connection_id,
                    kind = event.kind(),
                    "outbound buffer full, event dropped"
                ),
                Delivery::Closed => debug!(
                    user_id = %handle.user_id,
                    kind = event.kind(),
                    "connection closed, event dropped"
                ),
            }
        }
        delivered
    }
}
