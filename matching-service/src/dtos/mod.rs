pub mod groups;
pub mod matching;

pub use groups::{AddTransactionRequest, CreateGroupRequest, DeleteGroupResponse, GroupResponse};
pub use matching::{
    AutoMatchRequest, AutoMatchResponse, BatchApproveRequest, BatchApproveResponse,
    BatchRejectRequest, BatchRejectResponse, CandidateListResponse, CandidateParams,
    CandidateResponse, ConfirmRequest, ConfirmResponse, ManualMatchRequest, MatchListResponse,
    MatchResponse, MatchStatsResponse, ProposalListParams, ProposalResponse, RejectRequest,
    UnmatchResponse, UpdateMatchRequest,
};
